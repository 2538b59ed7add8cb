use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

/// Create a linked pair. Cancelling (or dropping) the [`Trigger`] resolves
/// every clone of the [`ShutdownSignal`].
pub fn channel() -> (Trigger, ShutdownSignal) {
    let (tx, rx) = oneshot::channel::<()>();
    let shared = async move {
        // A dropped sender counts as a trigger too.
        let _ = rx.await;
    }
    .boxed()
    .shared();

    (Trigger { tx: Some(tx) }, ShutdownSignal { shared })
}

pub struct Trigger {
    tx: Option<oneshot::Sender<()>>,
}

impl Trigger {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A future that resolves once the paired [`Trigger`] fires.
///
/// Clones resolve independently, so every task can hold its own copy and
/// select on it.
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Shared<BoxFuture<'static, ()>>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.shared.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn pending_until_cancelled() {
        let (trigger, mut signal) = channel();

        assert!((&mut signal).now_or_never().is_none());

        trigger.cancel();
        signal.await;
    }

    #[tokio::test]
    async fn drop_acts_as_cancel() {
        let (trigger, signal) = channel();

        drop(trigger);
        signal.await;
    }

    #[tokio::test]
    async fn clones_resolve_together() {
        let (trigger, signal) = channel();
        let first = signal.clone();
        let second = signal;

        trigger.cancel();
        first.await;
        second.await;
    }
}
