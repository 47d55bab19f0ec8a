/// Transfer coordinator: owns the batch, decides what starts when.
///
/// All state changes happen on one logical task that drains the network
/// client's event channel, so nothing here is locked.
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::BatchResult;
use crate::models::{
    Credentials, QueueMode, TransferId, TransferOutcome, TransferStatus, TransferTask,
};
use crate::network::{CredentialSink, EventReceiver, NetworkClient, NetworkEvent};

/// Coordinates a batch of transfers on top of a [`NetworkClient`].
pub struct TransferCoordinator<N: NetworkClient> {
    client: N,
    mode: QueueMode,
    /// Active transfers in registration order.
    transfers: Vec<TransferTask>,
    /// Finished transfers in completion order.
    history: Vec<TransferTask>,
    /// Process-wide proxy credentials, handed out once.
    proxy_credentials: Credentials,
    /// Set when the termination signal has fired.
    finished: bool,
}

impl<N: NetworkClient> TransferCoordinator<N> {
    pub fn new(client: N, mode: QueueMode, proxy_credentials: Credentials) -> Self {
        Self {
            client,
            mode,
            transfers: Vec::new(),
            history: Vec::new(),
            proxy_credentials,
            finished: false,
        }
    }

    /// Add a transfer to the active set. Nothing starts until the next check.
    pub fn register_transfer(&mut self, task: TransferTask) -> TransferId {
        let id = task.id;
        info!(
            "Transfer {} registered ({} {})",
            id.short(),
            task.direction.as_str(),
            task.request.url
        );
        self.transfers.push(task);
        id
    }

    /// Start whatever the queue mode allows, or signal termination when the
    /// active set is empty.
    pub fn check_for_all_done(&mut self) {
        let serial = self.mode == QueueMode::Serial;
        let mut i = 0;

        while i < self.transfers.len() {
            if self.transfers[i].is_started() {
                i += 1;
                continue;
            }
            if serial && self.running_count() > 0 {
                break;
            }

            match self.client.start(&self.transfers[i]) {
                Ok(()) => {
                    let task = &mut self.transfers[i];
                    task.mark_started();
                    debug!("Transfer {} started: {}", task.id.short(), task.request.url);
                    if serial {
                        break;
                    }
                    i += 1;
                }
                Err(e) => {
                    let task = self.transfers.remove(i);
                    warn!("Transfer {} could not start: {}", task.id.short(), e);
                    self.finish(task, TransferOutcome::failed(None, e));
                }
            }
        }

        if self.transfers.is_empty() && !self.finished {
            self.finished = true;
            info!("All Done.");
            self.client.quit();
        }
    }

    /// Retire a transfer and start the next ones.
    pub fn on_task_completed(&mut self, id: TransferId, outcome: TransferOutcome) {
        let Some(pos) = self.transfers.iter().position(|t| t.id == id) else {
            warn!("Completion for unknown transfer {}", id.short());
            return;
        };

        let task = self.transfers.remove(pos);
        self.finish(task, outcome);
        self.check_for_all_done();
    }

    /// Supply the transfer's credentials exactly once, so wrong credentials
    /// fail instead of looping.
    pub fn on_authentication_requested(&mut self, id: TransferId, sink: CredentialSink) {
        debug!("Authentication required for transfer {}", id.short());
        let credentials = self
            .transfers
            .iter_mut()
            .find(|t| t.id == id)
            .map(|t| t.credentials.take())
            .unwrap_or_default();

        if credentials.is_empty() {
            debug!("No credentials left for transfer {}", id.short());
        }
        if sink.send(credentials).is_err() {
            debug!("Transfer {} stopped waiting for credentials", id.short());
        }
    }

    /// Same one-shot rule for the process-wide proxy credentials.
    pub fn on_proxy_authentication_requested(&mut self, sink: CredentialSink) {
        debug!("Proxy authentication required");
        let credentials = self.proxy_credentials.take();
        if sink.send(credentials).is_err() {
            debug!("Proxy credential request abandoned");
        }
    }

    /// Record bytes moved for a running transfer.
    pub fn on_progress(&mut self, id: TransferId, transferred: u64, total: Option<u64>) {
        if let Some(task) = self.transfers.iter_mut().find(|t| t.id == id) {
            task.transferred = transferred;
            task.total = total;
            match total {
                Some(total) if total > 0 => debug!(
                    "Transfer {}: {}/{} bytes ({}%)",
                    id.short(),
                    transferred,
                    total,
                    (transferred.min(total) * 100) / total
                ),
                _ => debug!("Transfer {}: {} bytes", id.short(), transferred),
            }
        }
    }

    /// Dispatch one event from the network client.
    pub fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Progress { id, transferred, total } => {
                self.on_progress(id, transferred, total)
            }
            NetworkEvent::AuthenticationRequired { id, sink } => {
                self.on_authentication_requested(id, sink)
            }
            NetworkEvent::ProxyAuthenticationRequired { sink } => {
                self.on_proxy_authentication_requested(sink)
            }
            NetworkEvent::Completed { id, outcome } => self.on_task_completed(id, outcome),
        }
    }

    /// Kick off the queue and drain events until every transfer is done.
    ///
    /// Returns early if the event channel closes with transfers still active.
    pub async fn run(&mut self, events: &mut EventReceiver) {
        self.check_for_all_done();
        while !self.finished {
            match events.recv().await {
                Some(event) => self.handle_event(event),
                None => {
                    warn!(
                        "Network event channel closed with {} transfer(s) active",
                        self.transfers.len()
                    );
                    break;
                }
            }
        }
    }

    fn finish(&mut self, mut task: TransferTask, outcome: TransferOutcome) {
        let status = outcome
            .http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!("finished {} with http status: {}", task.request.url, status);
        if let Some(err) = &outcome.error {
            warn!("and error: {}", err);
        }
        task.mark_finished(outcome);
        self.history.push(task);
    }

    fn running_count(&self) -> usize {
        self.transfers.iter().filter(|t| t.is_started()).count()
    }

    /// Whether the termination signal has fired.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Active transfers, in registration order.
    pub fn transfers(&self) -> &[TransferTask] {
        &self.transfers
    }

    /// Finished transfers, in completion order.
    pub fn history(&self) -> &[TransferTask] {
        &self.history
    }

    pub fn client(&self) -> &N {
        &self.client
    }

    /// Count of finished transfers that carry an error.
    pub fn failed_count(&self) -> usize {
        self.history
            .iter()
            .filter(|t| t.status == TransferStatus::Failed)
            .count()
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        let running = self.running_count();
        let failed = self.failed_count();
        QueueStats {
            mode: self.mode,
            running,
            queued: self.transfers.len() - running,
            completed: self.history.len() - failed,
            failed,
            bytes: self.history.iter().map(|t| t.transferred).sum(),
        }
    }
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub mode: QueueMode,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl QueueStats {
    /// Pretty-printed JSON, for the end-of-run summary.
    pub fn to_json(&self) -> BatchResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
