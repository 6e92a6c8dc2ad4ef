use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{execute, Ledger, LedgerCall, LedgerError, LedgerReply};

/// Executes [LedgerCall]s in the background.
///
/// Each call runs in its own task so a slow ledger never blocks the session
/// loop. Replies are posted to `replies` in completion order, which is not
/// necessarily submission order. There is no cancellation: a reply is
/// always delivered unless the receiving side is gone.
#[derive(Debug)]
pub struct LedgerGateway<L: Ledger> {
    ledger: Arc<L>,
    replies: mpsc::UnboundedSender<LedgerReply>,
}

impl<L: Ledger> LedgerGateway<L> {
    pub fn new(ledger: Arc<L>, replies: mpsc::UnboundedSender<LedgerReply>) -> Self {
        Self { ledger, replies }
    }

    /// Must be called from within a tokio runtime.
    pub fn submit(&self, call: LedgerCall) {
        let ledger = Arc::clone(&self.ledger);
        let replies = self.replies.clone();
        let operation = call.request.operation();
        tracing::debug!(request = %call.id, %operation, "submitting ledger call");

        tokio::spawn(async move {
            let result = execute(&*ledger, call.request).await;
            match &result {
                Ok(outcome) => {
                    tracing::debug!(request = %call.id, %operation, ?outcome, "ledger call confirmed")
                }
                Err(e) => tracing::warn!(request = %call.id, %operation, error = %e, "ledger call failed"),
            }
            let reply = LedgerReply {
                id: call.id,
                operation,
                result,
            };
            if replies.send(reply).is_err() {
                tracing::debug!(request = %call.id, "session gone, dropping ledger reply");
            }
        });
    }

    /// Read the ledger clock in the background and answer on `reply`.
    pub fn query_time(&self, reply: oneshot::Sender<Result<u64, LedgerError>>) {
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            let now = ledger.now().await;
            if let Err(e) = &now {
                tracing::warn!(error = %e, "failed to read ledger time");
            }
            let _ = reply.send(now);
        });
    }
}
