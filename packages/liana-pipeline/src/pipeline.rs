//! The pipeline: a single-producer task bus with pluggable concurrency.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{abortable, AbortHandle};
use futures::{future, FutureExt, Stream, StreamExt};

use crate::event::{BoxTask, EventInner, RunHandle, TaskContext};
use crate::stream::{EventStream, PipelineCore, Process};

/// A queue of tasks drained through a user-supplied stream transformer.
///
/// The transformer decides the per-event concurrency policy: it receives
/// the pipeline's [`EventStream`] plus a [`Process`] handle and returns the
/// stream that actually drives execution. See [`transformers`](crate::transformers)
/// for the stock policies (sequential, concurrent, droppable, restartable).
///
/// Tasks are submitted with [`Pipeline::run`] and report back through the
/// returned [`RunHandle`]. A failing task never disables the pipeline; the
/// next `run` executes normally.
///
/// # Example
/// ```
/// # use liana_pipeline::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// # executor_scope(|| async {
/// let pipeline = Pipeline::new(transformers::sequential());
/// let doubled = pipeline.run(|_ctx| async { 21 * 2 });
/// assert_eq!(doubled.await.unwrap(), 42);
/// pipeline.dispose(false).await;
/// # }).await;
/// # }
/// ```
pub struct Pipeline<T: 'static> {
    core: Rc<PipelineCore<T>>,
    driver: Cell<Option<AbortHandle>>,
}

impl<T> Pipeline<T> {
    /// Create a pipeline whose event concurrency is decided by
    /// `transformer`.
    ///
    /// The transformed stream is driven by an internal task spawned on the
    /// current thread's executor, so this must be called where
    /// [`spawn_local`](crate::spawn_local) works (inside
    /// [`executor_scope`](crate::executor_scope) on native targets).
    pub fn new<S>(transformer: impl FnOnce(EventStream<T>, Process<T>) -> S) -> Self
    where
        S: Stream<Item = ()> + 'static,
    {
        let core = Rc::new(PipelineCore::new());
        let transformed = transformer(
            EventStream::new(core.clone()),
            Process::new(core.clone()),
        );
        let driver_core = core.clone();
        let driver = async move {
            // Task panics are contained inside the per-event sub-streams;
            // anything that unwinds out of the transformer itself is fatal
            // for the pipeline and tears it down.
            let result = AssertUnwindSafe(transformed.for_each(|()| future::ready(())))
                .catch_unwind()
                .await;
            if result.is_err() {
                driver_core.live.set(false);
                driver_core.disposed.set(true);
                driver_core.teardown();
            }
        };
        let (driver, handle) = abortable(driver);
        crate::spawn_local(async move {
            let _ = driver.await;
        });
        Pipeline {
            core,
            driver: Cell::new(Some(handle)),
        }
    }

    /// Submit a task. The returned future resolves with the task's value,
    /// or with [`RunError`](crate::RunError) when the event is cancelled or
    /// the task panics.
    ///
    /// On a disposed or inactive pipeline the event is cancelled
    /// synchronously and the handle resolves on its first poll.
    pub fn run<F, Fut>(&self, task: F) -> RunHandle<T>
    where
        F: FnOnce(TaskContext) -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let ctx = TaskContext::new(self.core.live.clone());
        let task: BoxTask<T> = Box::new(move |ctx| Box::pin(task(ctx)));
        let event = Rc::new(EventInner {
            task: RefCell::new(Some(task)),
            completer: RefCell::new(Some(tx)),
            ctx,
        });
        if self.core.disposed.get() || !self.core.live.get() {
            event.cancel();
        } else {
            self.core.queue.borrow_mut().push_back(event);
            self.core.wake_source();
        }
        RunHandle::new(rx)
    }

    /// Whether the pipeline still accepts tasks.
    pub fn is_active(&self) -> bool {
        self.core.live.get() && !self.core.disposed.get()
    }

    /// Dispose the pipeline. Idempotent; disposing twice resolves
    /// immediately.
    ///
    /// With `force`, every queued and active event is cancelled on the spot
    /// and the internal driver is aborted. Without it, the pipeline stops
    /// accepting tasks, the queued and in-flight events are drained to
    /// completion (their failures are absorbed here and reported only
    /// through their own [`RunHandle`]s), and the pipeline then goes
    /// inactive.
    pub async fn dispose(&self, force: bool) {
        if self.core.disposed.replace(true) {
            return;
        }
        if force {
            self.core.live.set(false);
            self.core.teardown();
            self.abort_driver();
            return;
        }
        // Let the transformer see the remaining queue, then wait it out.
        self.core.wake_source();
        Drain {
            core: self.core.clone(),
        }
        .await;
        self.core.live.set(false);
        self.core.wake_source();
        self.abort_driver();
    }

    fn abort_driver(&self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Resolves once the pipeline's queue and active set are both empty.
struct Drain<T: 'static> {
    core: Rc<PipelineCore<T>>,
}

impl<T> Future for Drain<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.core.is_drained() {
            Poll::Ready(())
        } else {
            self.core.park_drain(cx.waker());
            Poll::Pending
        }
    }
}
