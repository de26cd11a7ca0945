//! Executor-backed extensions for reactive subscriptions.

use std::future::Future;

use liana_reactive::Subscription;

/// [`Subscription`] operations that need an executor.
pub trait SubscriptionExt {
    /// Pause the subscription and schedule a resume for when `signal`
    /// completes.
    ///
    /// Values pushed while paused are dropped, matching
    /// [`Subscription::pause`]. A subscription cancelled before the signal
    /// fires stays cancelled; the late resume is a no-op.
    fn pause_until(&self, signal: impl Future<Output = ()> + 'static);
}

impl SubscriptionExt for Subscription {
    fn pause_until(&self, signal: impl Future<Output = ()> + 'static) {
        self.pause();
        let sub = self.clone();
        crate::spawn_local(async move {
            signal.await;
            if !sub.is_cancelled() {
                sub.resume();
            }
        });
    }
}
