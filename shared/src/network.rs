/// Message types between the transfer coordinator and the network client.
///
/// Commands flow coordinator -> client through the [`NetworkClient`] trait.
/// Events flow client -> coordinator over an unbounded mpsc channel of
/// [`NetworkEvent`] values, drained on a single task.
use tokio::sync::{mpsc, oneshot};

use crate::errors::TransferError;
use crate::models::{Credentials, TransferId, TransferOutcome, TransferTask};

/// Reply slot for an authentication challenge.
pub type CredentialSink = oneshot::Sender<Credentials>;

/// Sending half of the event channel, cloned into every in-flight transfer.
pub type EventSender = mpsc::UnboundedSender<NetworkEvent>;

/// Receiving half of the event channel, owned by the coordinator loop.
pub type EventReceiver = mpsc::UnboundedReceiver<NetworkEvent>;

/// Create a fresh event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ====== COMMANDS (coordinator -> client) ======

/// The external collaborator that performs the actual requests.
pub trait NetworkClient {
    /// Begin `task` asynchronously. The outcome arrives later as events.
    ///
    /// An error here means the transfer could not even be started.
    fn start(&mut self, task: &TransferTask) -> Result<(), TransferError>;

    /// Ask the process to wind down. Called once, after the last transfer.
    fn quit(&mut self);
}

// ====== EVENTS (client -> coordinator) ======

/// Events emitted by the network client.
#[derive(Debug)]
pub enum NetworkEvent {
    /// Bytes moved so far; `total` when the size is known.
    Progress {
        id: TransferId,
        transferred: u64,
        total: Option<u64>,
    },
    /// The server answered 401 and wants credentials for this transfer.
    AuthenticationRequired { id: TransferId, sink: CredentialSink },
    /// The proxy answered 407 and wants process-wide proxy credentials.
    ProxyAuthenticationRequired { sink: CredentialSink },
    /// The transfer finished, successfully or not.
    Completed { id: TransferId, outcome: TransferOutcome },
}

/// Send an authentication challenge and wait for the answer.
///
/// A dropped sink or closed channel yields empty credentials, which the
/// caller treats as "no more credentials".
pub async fn request_credentials(events: &EventSender, id: TransferId) -> Credentials {
    let (sink, answer) = oneshot::channel();
    if events.send(NetworkEvent::AuthenticationRequired { id, sink }).is_err() {
        return Credentials::default();
    }
    answer.await.unwrap_or_default()
}

/// Proxy counterpart of [`request_credentials`].
pub async fn request_proxy_credentials(events: &EventSender) -> Credentials {
    let (sink, answer) = oneshot::channel();
    if events.send(NetworkEvent::ProxyAuthenticationRequired { sink }).is_err() {
        return Credentials::default();
    }
    answer.await.unwrap_or_default()
}
