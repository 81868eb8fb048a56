use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::core::{CallId, HEARTBEAT_ID, MAX_CALL_ID};
use super::message::CallResult;

/// Completion side of an outstanding call
pub type Completion = oneshot::Sender<CallResult>;

/// Waiting side of an outstanding call
pub type PendingCall = oneshot::Receiver<CallResult>;

/// Inner state guarded by one lock so allocation can see what is outstanding
struct Inner {
    /// Last ID handed out
    last_id: CallId,
    /// Outstanding calls
    pending: HashMap<CallId, Completion>,
}

/// Hands out correlation IDs and tracks outstanding calls.
///
/// Every registered completion fires exactly once: with the gateway's
/// answer, with [`CallResult::NoResult`] on timeout, or by being dropped
/// (which waiters observe as `NoResult`) when overwritten.
pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    /// Creates an empty registry; the first ID handed out is 1
    pub fn new() -> Self {
        RequestRegistry {
            inner: Mutex::new(Inner {
                last_id: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Returns the next free correlation ID
    pub fn allocate(&self) -> CallId {
        let mut inner = self.inner.lock();
        Self::next_free(&mut inner)
    }

    fn next_free(inner: &mut Inner) -> CallId {
        loop {
            let mut next = inner.last_id.wrapping_add(1);
            if next == HEARTBEAT_ID {
                next += 1;
            }
            if next == 0 || next > MAX_CALL_ID {
                next = 1;
            }
            inner.last_id = next;
            if !inner.pending.contains_key(&next) {
                return next;
            }
        }
    }

    /// Records a completion for `id`, replacing any live one
    pub fn register(&self, id: CallId, completion: Completion) {
        if self.inner.lock().pending.insert(id, completion).is_some() {
            debug!(id, "Replaced pending completion");
        }
    }

    /// Allocates an ID and registers a fresh completion for it in one step
    pub fn register_new(&self) -> (CallId, PendingCall) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = Self::next_free(&mut inner);
        inner.pending.insert(id, tx);
        (id, rx)
    }

    /// Completes the call `id` with `result`. Returns false for unknown IDs.
    pub fn resolve(&self, id: CallId, result: Value) -> bool {
        let completion = self.inner.lock().pending.remove(&id);
        match completion {
            Some(completion) => {
                // The waiter may have given up already; nothing else to do
                let _ = completion.send(CallResult::Value(result));
                true
            }
            None => {
                trace!(id, "No pending call for response");
                false
            }
        }
    }

    /// Completes the call `id` with [`CallResult::NoResult`]
    pub fn timeout(&self, id: CallId) -> bool {
        let completion = self.inner.lock().pending.remove(&id);
        match completion {
            Some(completion) => {
                debug!(id, "Call timed out");
                let _ = completion.send(CallResult::NoResult);
                true
            }
            None => false,
        }
    }

    /// Forgets `id` without completing it
    pub fn cancel(&self, id: CallId) -> bool {
        self.inner.lock().pending.remove(&id).is_some()
    }

    /// Completes every outstanding call with [`CallResult::NoResult`].
    /// Returns how many there were.
    pub fn expire_all(&self) -> usize {
        let expired: Vec<Completion> = self.inner.lock().pending.drain().map(|(_, c)| c).collect();
        let count = expired.len();
        for completion in expired {
            let _ = completion.send(CallResult::NoResult);
        }
        count
    }

    /// Waits for `id` to complete, timing it out after `deadline`
    pub async fn wait(&self, id: CallId, mut pending: PendingCall, deadline: Duration) -> CallResult {
        match tokio::time::timeout(deadline, &mut pending).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => CallResult::NoResult,
            Err(_) => {
                self.timeout(id);
                // Either our timeout or a response that raced it is now queued
                pending.await.unwrap_or(CallResult::NoResult)
            }
        }
    }

    /// Number of outstanding calls
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether `id` is outstanding
    pub fn is_pending(&self, id: CallId) -> bool {
        self.inner.lock().pending.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_allocate_sequence() {
        let registry = RequestRegistry::new();
        assert_eq!(registry.allocate(), 1);
        assert_eq!(registry.allocate(), 2);
    }

    #[test]
    fn test_allocate_skips_heartbeat_id() {
        let registry = RequestRegistry::new();
        registry.inner.lock().last_id = HEARTBEAT_ID - 1;
        assert_eq!(registry.allocate(), HEARTBEAT_ID + 1);
    }

    #[test]
    fn test_allocate_wraps() {
        let registry = RequestRegistry::new();
        registry.inner.lock().last_id = MAX_CALL_ID;
        assert_eq!(registry.allocate(), 1);
    }

    #[test]
    fn test_allocate_skips_outstanding_ids() {
        let registry = RequestRegistry::new();
        let (tx, _rx) = oneshot::channel();
        registry.register(1, tx);
        registry.inner.lock().last_id = MAX_CALL_ID;
        assert_eq!(registry.allocate(), 2);
    }

    #[test]
    fn test_resolve_once() {
        let registry = RequestRegistry::new();
        let (id, mut rx) = registry.register_new();

        assert!(registry.resolve(id, json!("ok")));
        assert!(!registry.resolve(id, json!("ok")));
        assert_eq!(registry.pending_count(), 0);

        assert_eq!(assert_ok!(rx.try_recv()), CallResult::Value(json!("ok")));
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let registry = RequestRegistry::new();
        assert!(!registry.resolve(99, json!(1)));
    }

    #[test]
    fn test_register_overwrites() {
        let registry = RequestRegistry::new();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        registry.register(5, first_tx);
        registry.register(5, second_tx);

        assert_eq!(registry.pending_count(), 1);
        // Dropped completion is observed as closed
        assert_err!(first_rx.try_recv());

        registry.resolve(5, json!("done"));
        assert_eq!(assert_ok!(second_rx.try_recv()), CallResult::Value(json!("done")));
    }

    #[tokio::test]
    async fn test_wait_times_out_once() {
        let registry = RequestRegistry::new();
        let (id, rx) = registry.register_new();

        let result = registry.wait(id, rx, Duration::from_millis(20)).await;
        assert_eq!(result, CallResult::NoResult);
        assert!(!registry.is_pending(id));

        // A late response is a no-op
        assert!(!registry.resolve(id, json!("late")));
    }

    #[tokio::test]
    async fn test_wait_returns_response() {
        let registry = std::sync::Arc::new(RequestRegistry::new());
        let (id, rx) = registry.register_new();

        let resolver = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve(id, json!(["unwrapped elsewhere"]));
        });

        let result = registry.wait(id, rx, Duration::from_secs(2)).await;
        assert_eq!(result, CallResult::Value(json!(["unwrapped elsewhere"])));
    }

    #[test]
    fn test_expire_all() {
        let registry = RequestRegistry::new();
        let (first, mut first_rx) = registry.register_new();
        let (_, mut second_rx) = registry.register_new();

        assert_eq!(registry.expire_all(), 2);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(assert_ok!(first_rx.try_recv()), CallResult::NoResult);
        assert_eq!(assert_ok!(second_rx.try_recv()), CallResult::NoResult);

        assert!(!registry.resolve(first, json!("late")));
        assert_eq!(registry.expire_all(), 0);
    }

    #[test]
    fn test_timeout_unknown() {
        let registry = RequestRegistry::new();
        assert!(!registry.timeout(1));
        let (id, _rx) = registry.register_new();
        assert!(registry.cancel(id));
        assert!(!registry.timeout(id));
    }
}
