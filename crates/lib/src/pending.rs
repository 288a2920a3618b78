//! Pending request table: correlates an outgoing request id with the caller
//! waiting for its response.
//!
//! A record is removed exactly once: by the matching response, by
//! [`PendingRequests::fail_all`] when the socket drops, or when the caller's
//! [`PendingReply`] is dropped (timeout or caller cancellation).

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Reply = Result<Value>;

/// Shared handle to one connection's table of outstanding requests.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the handle the caller awaits.
    pub fn register(&self, id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id.to_string(), tx);
        PendingReply {
            id: id.to_string(),
            rx,
            table: self.clone(),
        }
    }

    /// Settle the request `id`. Returns false when no such request is outstanding.
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let Some(tx) = self.inner.lock().remove(id) else {
            return false;
        };
        // The waiter may have gone away between removal and send; nothing to do then.
        let _ = tx.send(reply);
        true
    }

    /// Fail every outstanding request with `err` and empty the table. Returns how many were failed.
    pub fn fail_all(&self, err: Error) -> usize {
        let drained: Vec<_> = self.inner.lock().drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: &str) {
        self.inner.lock().remove(id);
    }
}

/// Caller side of one pending request. Dropping it removes the record.
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Reply>,
    table: PendingRequests,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, failing with [`Error::RpcTimeout`] naming `method`
    /// when none arrives within `timeout`.
    pub async fn wait(mut self, timeout: Duration, method: &str) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                log::debug!("request {} ({}) timed out after {:?}", self.id, method, timeout);
                Err(Error::RpcTimeout(method.to_string()))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.id);
    }
}
