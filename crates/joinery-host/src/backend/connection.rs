//! One-shot connection signalling between a sandbox and the host.

use tokio::sync::oneshot;
use tracing::trace;

use super::BackendError;

const CONNECTION_TARGET: &str = "joinery_host::backend";

/// Creates a paired notifier and signal.
///
/// The backend keeps the [`ConnectionNotifier`] and consumes it exactly once
/// with [`ConnectionNotifier::connected`] or [`ConnectionNotifier::failed`].
/// The host awaits the [`ConnectionSignal`].
#[must_use]
pub fn connection_channel() -> (ConnectionNotifier, ConnectionSignal) {
    let (sender, receiver) = oneshot::channel();
    (ConnectionNotifier { sender }, ConnectionSignal { receiver })
}

/// Backend side of a connection signal.
#[derive(Debug)]
pub struct ConnectionNotifier {
    sender: oneshot::Sender<Result<(), BackendError>>,
}

impl ConnectionNotifier {
    /// Reports that the sandbox is connected and its API is available.
    pub fn connected(self) {
        self.send(Ok(()));
    }

    /// Reports that the sandbox failed before connecting.
    pub fn failed(self, reason: BackendError) {
        self.send(Err(reason));
    }

    fn send(self, outcome: Result<(), BackendError>) {
        if self.sender.send(outcome).is_err() {
            trace!(target: CONNECTION_TARGET, "connection outcome dropped: host stopped waiting");
        }
    }
}

/// Host side of a connection signal.
#[derive(Debug)]
pub struct ConnectionSignal {
    receiver: oneshot::Receiver<Result<(), BackendError>>,
}

impl ConnectionSignal {
    /// A signal that has already reported a successful connection.
    #[must_use]
    pub fn ready() -> Self {
        let (notifier, signal) = connection_channel();
        notifier.connected();
        signal
    }

    /// Waits for the backend's outcome.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure reason, or a generic error when the
    /// notifier was dropped without reporting.
    pub async fn wait(self) -> Result<(), BackendError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::new(
                "sandbox was dropped before reporting a connection outcome",
            )),
        }
    }
}
