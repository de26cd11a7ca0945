//! Asynchronous task pipeline for Liana.
//!
//! A [`Pipeline`] is a single-producer task bus: [`Pipeline::run`] enqueues
//! a task and returns its future, while a user-supplied stream
//! [`transformer`](transformers) decides how the per-event sub-streams
//! compose (one at a time, all at once, drop-while-busy, restart-on-new).
//! Each task receives a [`TaskContext`] for cooperative cancellation and
//! elapsed-time measurement.
//!
//! Everything here runs on the current thread's cooperative executor; no
//! threads are spawned.

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

mod event;
mod ext;
mod pipeline;
mod stream;
pub mod transformers;

pub use event::{PipelineEvent, RunError, RunHandle, TaskContext};
pub use ext::SubscriptionExt;
pub use pipeline::Pipeline;
pub use stream::{EventStream, Process, TaskRun};

use futures::Future;

/// Run `setup` where [`spawn_local`] works.
///
/// [`Pipeline`]s spawn their internal driver on the current thread's
/// executor. Browser targets always have one; on native targets this hosts
/// a `tokio::task::LocalSet` for the duration of the returned future. The
/// closure is invoked inside the scope, so pipelines can be constructed in
/// its synchronous part before the first `await`:
///
/// ```
/// # use liana_pipeline::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// executor_scope(|| {
///     let pipeline = Pipeline::new(transformers::sequential());
///     async move {
///         let answer = pipeline.run(|_ctx| async { 6 * 7 });
///         assert_eq!(answer.await.unwrap(), 42);
///     }
/// })
/// .await;
/// # }
/// ```
pub async fn executor_scope<Fut>(setup: impl FnOnce() -> Fut) -> Fut::Output
where
    Fut: Future,
{
    #[cfg(target_arch = "wasm32")]
    {
        setup().await
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::task::LocalSet::new()
            .run_until(async move { setup().await })
            .await
    }
}

/// Spawns a `!Send` future on the current thread's executor.
pub fn spawn_local(f: impl Future<Output = ()> + 'static) {
    #[cfg(not(target_arch = "wasm32"))]
    tokio::task::spawn_local(f);
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_futures::spawn_local(f);
}
