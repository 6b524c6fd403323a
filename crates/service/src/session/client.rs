//! The outbound request half of a session.
//!
//! Correlates responses to pending requests by message id. Closing
//! fails every in-flight call with `SessionClosed`; a per-call timeout
//! produces `Timeout` without touching the session.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use codec::message::Response;

use crate::ServiceError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct InteractionClient {
    pending: Mutex<HashMap<u32, oneshot::Sender<Response>>>,
    next_id: AtomicU32,
    timeout: Duration,
    closed: AtomicBool,
}

impl InteractionClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Allocates a message id and registers the response slot.
    pub fn allocate(&self) -> Result<(u32, oneshot::Receiver<Response>), ServiceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServiceError::SessionClosed);
        }

        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id, tx);

        Ok((message_id, rx))
    }

    /// Hands a received response to its waiter; false when nobody is
    /// waiting (late arrival after a timeout, typically).
    pub fn complete(&self, message_id: u32, response: Response) -> bool {
        match self.pending.lock().remove(&message_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forgets a pending request, e.g. when the send failed.
    pub fn abandon(&self, message_id: u32) {
        self.pending.lock().remove(&message_id);
    }

    /// Awaits the response for an allocated id.
    pub async fn wait(
        &self,
        message_id: u32,
        rx: oneshot::Receiver<Response>,
    ) -> Result<Response, ServiceError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ServiceError::SessionClosed),
            Err(_) => {
                self.abandon(message_id);
                Err(ServiceError::Timeout)
            }
        }
    }

    /// Idempotent; drops every pending sender so all waiters see
    /// `SessionClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::message::Status;

    fn response(message_id: u32) -> Response {
        Response {
            message_id,
            status: Status::Success,
            payload: ciborium::Value::Null,
        }
    }

    #[tokio::test]
    async fn responses_reach_their_waiters() {
        let client = InteractionClient::new(DEFAULT_REQUEST_TIMEOUT);
        let (id, rx) = client.allocate().unwrap();

        assert!(client.complete(id, response(id)));
        assert_eq!(client.wait(id, rx).await.unwrap().message_id, id);
    }

    #[tokio::test]
    async fn message_ids_are_unique_per_session() {
        let client = InteractionClient::new(DEFAULT_REQUEST_TIMEOUT);
        let (a, _rx_a) = client.allocate().unwrap();
        let (b, _rx_b) = client.allocate().unwrap();

        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_a_close() {
        let client = InteractionClient::new(Duration::from_millis(50));
        let (id, rx) = client.allocate().unwrap();

        assert!(matches!(
            client.wait(id, rx).await,
            Err(ServiceError::Timeout)
        ));

        // The slot is gone, a late response finds nobody.
        assert!(!client.complete(id, response(id)));

        // And the client keeps working.
        assert!(client.allocate().is_ok());
    }

    #[tokio::test]
    async fn close_fails_all_in_flight_calls() {
        let client = InteractionClient::new(DEFAULT_REQUEST_TIMEOUT);
        let (id, rx) = client.allocate().unwrap();

        client.close();

        assert!(matches!(
            client.wait(id, rx).await,
            Err(ServiceError::SessionClosed)
        ));
        assert!(matches!(
            client.allocate(),
            Err(ServiceError::SessionClosed)
        ));
        assert_eq!(client.pending_count(), 0);
    }
}
