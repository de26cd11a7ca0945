//! The pipeline's source stream and per-event sub-streams.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{CatchUnwind, LocalBoxFuture};
use futures::{FutureExt, Stream};

use crate::event::{EventInner, PipelineEvent, RunError};

/// Shared state between a [`Pipeline`](crate::Pipeline), its source stream
/// and its per-event sub-streams.
pub(crate) struct PipelineCore<T: 'static> {
    /// Events awaiting dispatch, FIFO.
    pub queue: RefCell<VecDeque<Rc<EventInner<T>>>>,
    /// Events currently inside a per-event sub-stream.
    pub active: RefCell<Vec<Rc<EventInner<T>>>>,
    /// Wake handle parked by the source stream while the queue is empty.
    source_waker: Cell<Option<Waker>>,
    /// Wakers parked by dispose waiting for queue and active set to empty.
    drain_wakers: RefCell<Vec<Waker>>,
    /// Cleared on dispose; shared with every task context, which is how
    /// `is_active` observes pipeline death.
    pub live: Rc<Cell<bool>>,
    /// Set as soon as a dispose begins; new `run`s cancel synchronously.
    pub disposed: Cell<bool>,
}

impl<T> PipelineCore<T> {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            active: RefCell::new(Vec::new()),
            source_waker: Cell::new(None),
            drain_wakers: RefCell::new(Vec::new()),
            live: Rc::new(Cell::new(true)),
            disposed: Cell::new(false),
        }
    }

    pub fn wake_source(&self) {
        if let Some(waker) = self.source_waker.take() {
            waker.wake();
        }
    }

    pub fn wake_drain(&self) {
        for waker in self.drain_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn park_drain(&self, waker: &Waker) {
        self.drain_wakers.borrow_mut().push(waker.clone());
    }

    pub fn is_drained(&self) -> bool {
        self.queue.borrow().is_empty() && self.active.borrow().is_empty()
    }

    /// Remove a finished event from the active set.
    pub fn finish_event(&self, event: &Rc<EventInner<T>>) {
        self.active.borrow_mut().retain(|e| !Rc::ptr_eq(e, event));
        self.wake_drain();
    }

    /// Cancel every queued and every active event and wake everything
    /// parked. Used by forced dispose and by transformer-failure teardown.
    pub fn teardown(&self) {
        let queued: Vec<_> = self.queue.borrow_mut().drain(..).collect();
        for event in &queued {
            event.cancel();
        }
        let active: Vec<_> = self.active.borrow_mut().drain(..).collect();
        for event in &active {
            event.cancel();
        }
        self.wake_source();
        self.wake_drain();
    }
}

/// The pipeline's source stream: yields queued events to the transformer in
/// FIFO order.
///
/// This is a hand-rolled pull stream rather than a channel: when the queue
/// is empty it parks the task waker and [`Pipeline::run`](crate::Pipeline::run)
/// wakes it after enqueueing, so draining one event costs no intermediate
/// buffering.
pub struct EventStream<T: 'static> {
    core: Rc<PipelineCore<T>>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(core: Rc<PipelineCore<T>>) -> Self {
        Self { core }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = PipelineEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let core = &self.get_mut().core;
        if !core.live.get() {
            return Poll::Ready(None);
        }
        if let Some(event) = core.queue.borrow_mut().pop_front() {
            // The queue shrank; a graceful dispose may be waiting on it.
            core.wake_drain();
            return Poll::Ready(Some(PipelineEvent(event)));
        }
        if core.disposed.get() {
            return Poll::Ready(None);
        }
        core.source_waker.set(Some(cx.waker().clone()));
        Poll::Pending
    }
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("queued", &self.core.queue.borrow().len())
            .finish_non_exhaustive()
    }
}

/// The `process` handle given to transformers: turns one event into its
/// per-event sub-stream.
pub struct Process<T: 'static> {
    core: Rc<PipelineCore<T>>,
}

impl<T> Process<T> {
    pub(crate) fn new(core: Rc<PipelineCore<T>>) -> Self {
        Self { core }
    }

    /// Begin executing an event. The returned [`TaskRun`] drives the task
    /// when polled, emits one completion marker if the event was not
    /// cancelled, and then terminates.
    pub fn run(&self, event: PipelineEvent<T>) -> TaskRun<T> {
        let event = event.0;
        self.core.active.borrow_mut().push(event.clone());
        TaskRun {
            core: self.core.clone(),
            event,
            state: TaskRunState::Idle,
            removed: false,
        }
    }
}

impl<T> Clone for Process<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Process<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").finish_non_exhaustive()
    }
}

enum TaskRunState<T> {
    Idle,
    Running(CatchUnwind<AssertUnwindSafe<LocalBoxFuture<'static, T>>>),
    Done,
}

/// A per-event sub-stream: at most one completion marker, then termination.
///
/// The task's result travels through the event's completer, never through
/// the stream; the stream's item only tells the transformer that the event
/// finished, which is all a concurrency policy needs.
///
/// Execution order on completion: the completer resolves first (success
/// value, or the contained panic), then the marker is emitted iff the event
/// was not cancelled. Dropping a `TaskRun` removes its event from the
/// pipeline's active set.
pub struct TaskRun<T: 'static> {
    core: Rc<PipelineCore<T>>,
    event: Rc<EventInner<T>>,
    state: TaskRunState<T>,
    removed: bool,
}

impl<T> TaskRun<T> {
    /// Cooperatively cancel this run: the caller's future resolves to
    /// [`RunError::Cancelled`](crate::RunError::Cancelled) and the context
    /// flips inactive, but the task body is not interrupted; keep polling
    /// the stream to drive it to its natural end.
    pub fn cancel(&self) {
        self.event.cancel();
    }

    fn finish(&mut self) {
        if !self.removed {
            self.removed = true;
            self.core.finish_event(&self.event);
        }
    }
}

impl<T> Stream for TaskRun<T> {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                TaskRunState::Idle => {
                    let Some(task) = this.event.task.borrow_mut().take() else {
                        this.state = TaskRunState::Done;
                        this.finish();
                        return Poll::Ready(None);
                    };
                    this.event.ctx.start();
                    let future = AssertUnwindSafe(task(this.event.ctx.clone())).catch_unwind();
                    this.state = TaskRunState::Running(future);
                }
                TaskRunState::Running(future) => {
                    return match future.poll_unpin(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(Ok(value)) => {
                            this.state = TaskRunState::Done;
                            this.finish();
                            let cancelled = this.event.ctx.is_cancelled();
                            this.event.complete(Ok(value));
                            if cancelled {
                                Poll::Ready(None)
                            } else {
                                Poll::Ready(Some(()))
                            }
                        }
                        Poll::Ready(Err(payload)) => {
                            this.state = TaskRunState::Done;
                            this.finish();
                            // The completer resolves first so the caller's
                            // future rejects immediately; the stream then
                            // ends cleanly and the transformer moves on.
                            this.event.complete(Err(RunError::Panicked(payload)));
                            Poll::Ready(None)
                        }
                    };
                }
                TaskRunState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for TaskRun<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<T> fmt::Debug for TaskRun<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            TaskRunState::Idle => "Idle",
            TaskRunState::Running(_) => "Running",
            TaskRunState::Done => "Done",
        };
        f.debug_struct("TaskRun")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}
