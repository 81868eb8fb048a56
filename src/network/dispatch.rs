use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::core::Result;
use crate::protocol::Notification;

/// Consumer of gateway notifications.
///
/// Called on the transport loop, so implementations should only update
/// cached state and hand longer work to their own tasks.
pub trait Subscriber: Send + Sync {
    /// Handles one notification
    fn notify(&self, notification: &Notification) -> Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&Notification) -> Result<()> + Send + Sync,
{
    fn notify(&self, notification: &Notification) -> Result<()> {
        self(notification)
    }
}

/// Position of a subscriber in delivery order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub usize);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

/// A subscriber that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Who failed
    pub subscriber: SubscriberId,
    /// Error text or panic message
    pub reason: String,
}

/// Fans notifications out to every subscriber in registration order
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let mut subscribers = self.subscribers.write();
        subscribers.push(subscriber);
        SubscriberId(subscribers.len() - 1)
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `notification` to every subscriber.
    ///
    /// A failing subscriber is reported and skipped; later subscribers still
    /// receive the notification.
    pub fn broadcast(&self, notification: &Notification) -> Vec<DeliveryFailure> {
        // Snapshot so a subscriber may subscribe others from inside notify
        let subscribers = self.subscribers.read().clone();
        trace!(kind = notification.kind().as_str(), count = subscribers.len(), "Broadcasting");

        let mut failures = Vec::new();
        for (index, subscriber) in subscribers.iter().enumerate() {
            let id = SubscriberId(index);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify(notification)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(subscriber = %id, %reason, "Subscriber failed");
            failures.push(DeliveryFailure { subscriber: id, reason });
        }
        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Availability, Error};
    use crate::protocol::{EventKind, Params, Push};
    use parking_lot::Mutex;

    fn push(sid: &str) -> Notification {
        Notification::Push(Push {
            model: "lumi.sensor_motion".to_string(),
            sid: sid.to_string(),
            kind: EventKind::Event("event.motion".to_string()),
            params: Params::new(),
        })
    }

    #[test]
    fn test_delivery_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..4 {
            let log = log.clone();
            let id = dispatcher.subscribe(Arc::new(move |_: &Notification| -> Result<()> {
                log.lock().push(n);
                Ok(())
            }));
            assert_eq!(id, SubscriberId(n));
        }

        let failures = dispatcher.broadcast(&push("a"));
        assert!(failures.is_empty());
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_error_isolation() {
        let dispatcher = EventDispatcher::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        dispatcher.subscribe(Arc::new(|_: &Notification| -> Result<()> { Err(Error::subscriber("cache full")) }));
        dispatcher.subscribe(Arc::new(|_: &Notification| -> Result<()> { panic!("boom") }));
        let sink = delivered.clone();
        dispatcher.subscribe(Arc::new(move |n: &Notification| -> Result<()> {
            sink.lock().push(n.clone());
            Ok(())
        }));

        let notification = Notification::availability(Availability::Unavailable);
        let failures = dispatcher.broadcast(&notification);

        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].subscriber, SubscriberId(0));
        assert_eq!(failures[0].reason, "Subscriber error: cache full");
        assert_eq!(failures[1].reason, "panicked: boom");
        assert_eq!(*delivered.lock(), vec![notification]);
    }

    #[test]
    fn test_subscribe_during_broadcast() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.subscribe(Arc::new(move |_: &Notification| -> Result<()> {
            inner.subscribe(Arc::new(|_: &Notification| -> Result<()> { Ok(()) }));
            Ok(())
        }));

        dispatcher.broadcast(&push("b"));
        assert_eq!(dispatcher.len(), 2);
    }
}
