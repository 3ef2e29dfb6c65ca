use std::collections::HashMap;
use tokio::sync::{oneshot, RwLock};

use crate::error::BackendError;
use crate::protocol::JsonRpcResponse;

pub type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, BackendError>>;

/// Requests written to a backend process that are still waiting for an answer,
/// keyed by request id. An entry is resolved at most once: the first response,
/// rejection or removal takes it out of the table.
pub struct PendingRequests {
    requests: RwLock<HashMap<String, ResponseSender>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, id: String, sender: ResponseSender) {
        self.requests.write().await.insert(id, sender);
    }

    /// Resolve the entry for `id`. Returns false when no such entry is pending.
    pub async fn respond(&self, id: &str, response: JsonRpcResponse) -> bool {
        match self.requests.write().await.remove(id) {
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub async fn reject(&self, id: &str, error: BackendError) -> bool {
        match self.requests.write().await.remove(id) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without notifying its waiter.
    pub async fn remove(&self, id: &str) -> bool {
        self.requests.write().await.remove(id).is_some()
    }

    pub async fn reject_all(&self, error: BackendError) {
        for (_, tx) in self.requests.write().await.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, marker: &str) -> JsonRpcResponse {
        serde_json::from_value(json!({"jsonrpc": "2.0", "id": id, "result": {"marker": marker}}))
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_only_matching_entry() {
        let pending = PendingRequests::new();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        pending.insert("a".to_string(), tx_a).await;
        pending.insert("b".to_string(), tx_b).await;

        assert!(pending.respond("b", response("b", "for-b")).await);

        let resolved = rx_b.await.unwrap().unwrap();
        assert_eq!(resolved.result.unwrap()["marker"], "for-b");

        // A is still waiting
        assert!(rx_a.try_recv().is_err());
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn test_second_response_for_same_id_is_ignored() {
        let pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("a".to_string(), tx).await;

        assert!(pending.respond("a", response("a", "first")).await);
        assert!(!pending.respond("a", response("a", "second")).await);

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.result.unwrap()["marker"], "first");
    }

    #[tokio::test]
    async fn test_reject_all_drains_table() {
        let pending = PendingRequests::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        pending.insert("a".to_string(), tx_a).await;
        pending.insert("b".to_string(), tx_b).await;

        pending
            .reject_all(BackendError::Process("spawn failed".to_string()))
            .await;

        assert!(pending.is_empty().await);
        assert!(matches!(rx_a.await.unwrap(), Err(BackendError::Process(_))));
        assert!(matches!(rx_b.await.unwrap(), Err(BackendError::Process(_))));
    }
}
