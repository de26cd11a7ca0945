//! Pipeline events, task contexts and run results.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use thiserror::Error;

/// Why a pipeline task's result never arrived.
#[derive(Error)]
pub enum RunError {
    /// The event was cancelled before the task produced a result: dropped by
    /// the transformer, superseded by a restart, or swept up in a forced
    /// dispose.
    #[error("task was cancelled before completion")]
    Cancelled,
    /// The task body panicked. The payload is preserved.
    #[error("task panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
}

impl RunError {
    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }

    /// Whether the task panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, RunError::Panicked(_))
    }

    /// Consume the error, returning the panic payload.
    ///
    /// # Panics
    /// Panics if the error is not [`RunError::Panicked`].
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            RunError::Panicked(payload) => payload,
            RunError::Cancelled => panic!("not a panic error"),
        }
    }
}

impl fmt::Debug for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Cancelled => f.pad("Cancelled"),
            RunError::Panicked(_) => f.pad("Panicked(..)"),
        }
    }
}

/// Per-task handle exposing liveness and elapsed time.
///
/// Cancellation is cooperative: a cancelled context reports
/// [`is_active`](TaskContext::is_active)` == false` but running task code is
/// never interrupted; the task decides when (and whether) to check.
#[derive(Clone, Debug)]
pub struct TaskContext {
    inner: Rc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    cancelled: Cell<bool>,
    pipeline_live: Rc<Cell<bool>>,
    started: Cell<Option<Instant>>,
}

impl TaskContext {
    pub(crate) fn new(pipeline_live: Rc<Cell<bool>>) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                cancelled: Cell::new(false),
                pipeline_live,
                started: Cell::new(None),
            }),
        }
    }

    /// True while the event is not cancelled and the pipeline is still
    /// active. A task can poll this to abandon work early.
    pub fn is_active(&self) -> bool {
        !self.inner.cancelled.get() && self.inner.pipeline_live.get()
    }

    /// Monotonic duration since the task body was invoked; zero before
    /// that.
    pub fn elapsed(&self) -> Duration {
        self.inner
            .started
            .get()
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn set_cancelled(&self) {
        self.inner.cancelled.set(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Start the stopwatch. Idempotent.
    pub(crate) fn start(&self) {
        if self.inner.started.get().is_none() {
            self.inner.started.set(Some(Instant::now()));
        }
    }
}

pub(crate) type BoxTask<T> = Box<dyn FnOnce(TaskContext) -> LocalBoxFuture<'static, T>>;

pub(crate) struct EventInner<T> {
    pub task: RefCell<Option<BoxTask<T>>>,
    pub completer: RefCell<Option<oneshot::Sender<Result<T, RunError>>>>,
    pub ctx: TaskContext,
}

impl<T> EventInner<T> {
    /// Resolve the external completer. First resolution wins; later calls
    /// are no-ops, which is what makes completion idempotent across the
    /// cancel and finish paths.
    pub fn complete(&self, result: Result<T, RunError>) {
        if let Some(tx) = self.completer.borrow_mut().take() {
            let _ = tx.send(result);
        }
    }

    /// Flip the context inactive and resolve the completer with
    /// [`RunError::Cancelled`].
    pub fn cancel(&self) {
        self.ctx.set_cancelled();
        self.complete(Err(RunError::Cancelled));
    }
}

/// An event travelling through a pipeline's transformer.
///
/// Opaque to transformers: hand it to [`Process::run`](crate::Process::run)
/// to execute it, or drop it to discard it (the caller's
/// [`RunHandle`] then resolves to [`RunError::Cancelled`]).
pub struct PipelineEvent<T: 'static>(pub(crate) Rc<EventInner<T>>);

impl<T> fmt::Debug for PipelineEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEvent").finish_non_exhaustive()
    }
}

/// Future returned by [`Pipeline::run`](crate::Pipeline::run), resolving to
/// the task's result.
///
/// Resolution is channel-backed: results sent on already-terminal paths
/// (disposed pipeline, synchronous cancellation) complete the handle on its
/// first poll without an extra event-loop hop.
#[derive(Debug)]
pub struct RunHandle<T> {
    rx: oneshot::Receiver<Result<T, RunError>>,
}

impl<T> RunHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, RunError>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for RunHandle<T> {
    type Output = Result<T, RunError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The completer was dropped without resolving: the event was
            // discarded (droppable policy) or torn down with the pipeline.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(RunError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_accessors() {
        assert!(RunError::Cancelled.is_cancelled());
        assert!(!RunError::Cancelled.is_panic());

        let panicked = RunError::Panicked(Box::new("boom"));
        assert!(panicked.is_panic());
        let payload = panicked.into_panic();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
    }

    #[test]
    fn context_reports_liveness() {
        let live = Rc::new(Cell::new(true));
        let ctx = TaskContext::new(live.clone());
        assert!(ctx.is_active());
        assert_eq!(ctx.elapsed(), Duration::ZERO);

        live.set(false);
        assert!(!ctx.is_active());

        live.set(true);
        ctx.set_cancelled();
        assert!(!ctx.is_active());
    }

    #[test]
    fn context_stopwatch_starts_once() {
        let ctx = TaskContext::new(Rc::new(Cell::new(true)));
        ctx.start();
        std::thread::sleep(Duration::from_millis(5));
        let first = ctx.elapsed();
        assert!(first > Duration::ZERO);

        // A second start must not reset the stopwatch.
        ctx.start();
        assert!(ctx.elapsed() >= first);
    }
}
