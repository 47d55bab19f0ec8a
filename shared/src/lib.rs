/// batchget shared library
///
/// Transfer task model, network event protocol, and the coordinator that
/// sequences a batch of downloads/uploads on top of a network client.
pub mod coordinator;
pub mod errors;
pub mod models;
pub mod network;

pub use coordinator::{QueueStats, TransferCoordinator};
pub use errors::{BatchError, BatchResult, TransferError};
pub use models::{
    Credentials, Direction, QueueMode, TransferId, TransferOutcome, TransferRequest,
    TransferStatus, TransferTask, UploadMethod,
};
pub use network::{CredentialSink, EventReceiver, EventSender, NetworkClient, NetworkEvent};
