use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::signal::unix::Signal;
use tokio::sync::mpsc;

pub type SignalTx = mpsc::Sender<SignalTo>;
pub type SignalRx = mpsc::Receiver<SignalTo>;

/// Control messages that drive the top level run loop.
#[derive(Debug, Eq, PartialEq)]
pub enum SignalTo {
    /// Shut down gracefully.
    Shutdown,
    /// Shut down immediately.
    Quit,
}

/// Spawns a permanent task forwarding OS signals to the returned receiver.
pub fn signal_channel() -> SignalRx {
    let (tx, rx) = mpsc::channel(2);
    let mut signals = os_signals();

    tokio::spawn(async move {
        use futures::StreamExt;

        while let Some(value) = signals.next().await {
            if tx.send(value).await.is_err() {
                break;
            }
        }
    });

    rx
}

pub struct Signals {
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl Stream for Signals {
    type Item = SignalTo;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.sigint.poll_recv(cx).is_ready() {
            info!(message = "signal received", signal = "SIGINT");
            return Poll::Ready(Some(SignalTo::Shutdown));
        }

        if this.sigterm.poll_recv(cx).is_ready() {
            info!(message = "signal received", signal = "SIGTERM");
            return Poll::Ready(Some(SignalTo::Shutdown));
        }

        if this.sigquit.poll_recv(cx).is_ready() {
            info!(message = "signal received", signal = "SIGQUIT");
            return Poll::Ready(Some(SignalTo::Quit));
        }

        Poll::Pending
    }
}

/// Signals from OS/user
pub fn os_signals() -> Signals {
    use tokio::signal::unix::{SignalKind, signal};

    let sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handle");
    let sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handle");
    let sigquit = signal(SignalKind::quit()).expect("failed to set up SIGQUIT handle");

    Signals {
        sigint,
        sigterm,
        sigquit,
    }
}
