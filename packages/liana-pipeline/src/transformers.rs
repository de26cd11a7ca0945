//! Stock event transformers.
//!
//! A transformer is a function from the pipeline's source stream (plus the
//! `process` handle) to the stream that actually drives execution. The
//! per-event sub-streams returned by [`Process::run`] carry one completion
//! marker each, so concurrency policies compose out of ordinary stream
//! combinators: awaiting a sub-stream serializes, merging sub-streams
//! parallelizes, dropping or cancelling sub-streams sheds load.
//!
//! Custom policies can be written against the same building blocks; the
//! only coupling to the pipeline is the sub-stream lifetime.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::LocalBoxStream;
use futures::{Stream, StreamExt};
use pin_project::pin_project;

use crate::event::PipelineEvent;
use crate::stream::{EventStream, Process, TaskRun};

/// One event at a time, in submission order: each task runs to completion
/// before the next event is dispatched.
pub fn sequential<T: 'static>(
) -> impl FnOnce(EventStream<T>, Process<T>) -> LocalBoxStream<'static, ()> {
    |events, process| {
        events
            .map(move |event| process.run(event))
            .flatten()
            .boxed_local()
    }
}

/// All events at once: tasks run concurrently and complete in whatever
/// order they finish.
pub fn concurrent<T: 'static>(
) -> impl FnOnce(EventStream<T>, Process<T>) -> LocalBoxStream<'static, ()> {
    |events, process| {
        events
            .map(move |event| process.run(event))
            .flatten_unordered(None)
            .boxed_local()
    }
}

/// While a task is in flight, newly arriving events are discarded; their
/// [`RunHandle`](crate::RunHandle)s resolve to
/// [`RunError::Cancelled`](crate::RunError::Cancelled).
pub fn droppable<T: 'static>() -> impl FnOnce(EventStream<T>, Process<T>) -> Droppable<EventStream<T>, T>
{
    |events, process| Droppable {
        events,
        process,
        current: None,
        done: false,
    }
}

/// A newly arriving event cancels the in-flight task and takes its place.
///
/// Cancellation is cooperative: the superseded task keeps running (parked in
/// a drain list, its output discarded) and observes the cancellation through
/// its context's `is_active`.
pub fn restartable<T: 'static>(
) -> impl FnOnce(EventStream<T>, Process<T>) -> Restartable<EventStream<T>, T> {
    |events, process| Restartable {
        events,
        process,
        current: None,
        draining: Vec::new(),
        done: false,
    }
}

/// Stream returned by the [`droppable`] policy.
#[pin_project]
pub struct Droppable<S, T: 'static> {
    #[pin]
    events: S,
    process: Process<T>,
    current: Option<TaskRun<T>>,
    done: bool,
}

impl<S, T> Stream for Droppable<S, T>
where
    S: Stream<Item = PipelineEvent<T>>,
{
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            // Drain the source: the first event becomes the current run,
            // events arriving while one is in flight are dropped on the
            // floor.
            while !*this.done {
                match this.events.as_mut().poll_next(cx) {
                    Poll::Ready(Some(event)) => {
                        if this.current.is_none() {
                            *this.current = Some(this.process.run(event));
                        }
                    }
                    Poll::Ready(None) => *this.done = true,
                    Poll::Pending => break,
                }
            }
            if let Some(run) = this.current.as_mut() {
                match Pin::new(run).poll_next(cx) {
                    Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                    Poll::Ready(None) => {
                        *this.current = None;
                        if !*this.done {
                            // The source may have parked while we were
                            // busy; give it another chance this poll.
                            continue;
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
            return if *this.done && this.current.is_none() {
                Poll::Ready(None)
            } else {
                Poll::Pending
            };
        }
    }
}

impl<S, T> fmt::Debug for Droppable<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Droppable")
            .field("busy", &self.current.is_some())
            .finish_non_exhaustive()
    }
}

/// Stream returned by the [`restartable`] policy.
#[pin_project]
pub struct Restartable<S, T: 'static> {
    #[pin]
    events: S,
    process: Process<T>,
    current: Option<TaskRun<T>>,
    /// Cancelled runs being polled to their natural end.
    draining: Vec<TaskRun<T>>,
    done: bool,
}

impl<S, T> Stream for Restartable<S, T>
where
    S: Stream<Item = PipelineEvent<T>>,
{
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        while !*this.done {
            match this.events.as_mut().poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    if let Some(old) = this.current.take() {
                        old.cancel();
                        this.draining.push(old);
                    }
                    *this.current = Some(this.process.run(event));
                }
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => break,
            }
        }

        this.draining.retain_mut(|run| loop {
            match Pin::new(&mut *run).poll_next(cx) {
                // A cancelled run emits no marker, but drain defensively.
                Poll::Ready(Some(())) => continue,
                Poll::Ready(None) => break false,
                Poll::Pending => break true,
            }
        });

        if let Some(run) = this.current.as_mut() {
            match Pin::new(run).poll_next(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => *this.current = None,
                Poll::Pending => {}
            }
        }

        if *this.done && this.current.is_none() && this.draining.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl<S, T> fmt::Debug for Restartable<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restartable")
            .field("busy", &self.current.is_some())
            .field("draining", &self.draining.len())
            .finish_non_exhaustive()
    }
}
