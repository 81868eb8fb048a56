use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::core::{Availability, CallId, GATEWAY_MODEL, GATEWAY_SID, PING_METHOD, UNKNOWN_RESULT};

/// Key/value payload of a message
pub type Params = Map<String, Value>;

/// Name of the synthetic event emitted on liveness transitions
pub const EVENT_AVAILABILITY: &str = "event.availability";
/// Event name under which `_otc.log` metadata pushes are dispatched
pub const EVENT_METADATA: &str = "internal.metadata";
/// Event name under which `props` pushes are dispatched
pub const EVENT_VALUES: &str = "internal.values";

static AVAILABILITY_KIND: EventKind = EventKind::Availability;

/// Request payload handed to the client by callers
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    body: Map<String, Value>,
}

impl Request {
    /// Creates a request invoking `method`
    pub fn new(method: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("method".to_string(), Value::String(method.into()));
        Request { body }
    }

    /// Creates a request from a raw JSON object
    pub fn from_map(body: Map<String, Value>) -> Self {
        Request { body }
    }

    /// The heartbeat probe
    pub fn ping() -> Self {
        Request::new(PING_METHOD)
    }

    /// Sets the `params` field
    pub fn with_params(mut self, params: Value) -> Self {
        self.body.insert("params".to_string(), params);
        self
    }

    /// Sets an arbitrary top-level field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Method this request invokes, if any
    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }

    /// Whether this is the liveness probe
    pub fn is_ping(&self) -> bool {
        self.method() == Some(PING_METHOD)
    }

    /// Raw JSON object
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }
}

/// A request waiting in the outbound queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    /// Correlation ID merged into the payload; `None` for heartbeats
    pub id: Option<CallId>,
    /// Payload fields
    pub request: Request,
}

impl OutboundCall {
    /// Creates a correlated call
    pub fn new(id: CallId, request: Request) -> Self {
        OutboundCall { id: Some(id), request }
    }

    /// Creates the uncorrelated heartbeat probe
    pub fn heartbeat() -> Self {
        OutboundCall {
            id: None,
            request: Request::ping(),
        }
    }
}

/// How a decoded message is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Answer to a correlated call
    Response,
    /// Unsolicited event or property report
    Push,
    /// Neither result nor method
    Invalid,
}

/// A normalized message received from the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Correlation ID
    pub id: Option<CallId>,
    /// Request or push name
    pub method: Option<String>,
    /// Normalized payload
    pub params: Params,
    /// Normalized result, present only on responses
    pub result: Option<Value>,
    /// Device model, defaulted to the gateway's own
    pub model: String,
    /// Source device ID, defaulted to the gateway's own
    pub sid: String,
}

impl Message {
    /// Normalizes one decoded JSON value. Returns `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };

        let id = object
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| CallId::try_from(id).ok());
        let method = match object.remove("method") {
            Some(Value::String(method)) => Some(method),
            _ => None,
        };
        let result = object.remove("result").map(normalize_result);
        let params = normalize_params(object.remove("params"));
        let model = take_string(&mut object, "model").unwrap_or_else(|| GATEWAY_MODEL.to_string());
        let sid = take_string(&mut object, "sid").unwrap_or_else(|| GATEWAY_SID.to_string());

        Some(Message {
            id,
            method,
            params,
            result,
            model,
            sid,
        })
    }

    /// Classifies the message by shape
    pub fn kind(&self) -> MessageKind {
        if self.result.is_some() {
            MessageKind::Response
        } else if self.method.is_some() {
            MessageKind::Push
        } else {
            MessageKind::Invalid
        }
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(value)) => Some(value),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

/// Normalizes a wire `params` value into a mapping.
///
/// Lists are unwrapped to their first element; any value that is still not a
/// mapping (numbers included) is kept under the `data` key.
pub fn normalize_params(params: Option<Value>) -> Params {
    let value = match params {
        None | Some(Value::Null) => return Params::new(),
        Some(Value::Array(items)) => match items.into_iter().next() {
            None => return Params::new(),
            Some(first) => first,
        },
        Some(other) => other,
    };

    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Params::new();
            map.insert("data".to_string(), other);
            map
        }
    }
}

/// Normalizes a wire `result` value into a scalar
pub fn normalize_result(result: Value) -> Value {
    match result {
        Value::Array(items) => items
            .into_iter()
            .next()
            .unwrap_or_else(|| Value::String(UNKNOWN_RESULT.to_string())),
        other => other,
    }
}

/// Outcome of a correlated call
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// The gateway answered
    Value(Value),
    /// No answer arrived before the deadline
    NoResult,
}

impl CallResult {
    /// The answer, if one arrived
    pub fn value(&self) -> Option<&Value> {
        match self {
            CallResult::Value(value) => Some(value),
            CallResult::NoResult => None,
        }
    }

    /// The answer as a string slice, if it is one
    pub fn as_str(&self) -> Option<&str> {
        self.value().and_then(Value::as_str)
    }

    /// Whether the call went unanswered
    pub fn is_no_result(&self) -> bool {
        matches!(self, CallResult::NoResult)
    }
}

/// Event name carried by a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `event.*` push, named by its method
    Event(String),
    /// `_otc.log` metadata push
    Metadata,
    /// `props` value report
    Values,
    /// Synthetic liveness transition
    Availability,
}

impl EventKind {
    /// Wire-level name of the event
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Event(name) => name,
            EventKind::Metadata => EVENT_METADATA,
            EventKind::Values => EVENT_VALUES,
            EventKind::Availability => EVENT_AVAILABILITY,
        }
    }
}

/// What to do with a push, by method name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodRoute {
    /// `internal.*` control traffic, dropped silently
    Internal,
    /// Known method nothing consumes
    Ignored,
    /// Dispatched to subscribers
    Dispatch(EventKind),
    /// Unrecognized, logged and dropped
    Unknown,
}

/// Looks up the dispatch rule for a push method
pub fn classify_method(method: &str) -> MethodRoute {
    match method {
        m if m.starts_with("internal.") => MethodRoute::Internal,
        "_sync.neighborDevInfo" => MethodRoute::Ignored,
        m if m.starts_with("event.") => MethodRoute::Dispatch(EventKind::Event(m.to_string())),
        "_otc.log" => MethodRoute::Dispatch(EventKind::Metadata),
        "props" => MethodRoute::Dispatch(EventKind::Values),
        _ => MethodRoute::Unknown,
    }
}

/// A dispatched push
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    /// Device model
    pub model: String,
    /// Source device ID
    pub sid: String,
    /// Event name
    pub kind: EventKind,
    /// Normalized payload
    pub params: Params,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An event reported by the gateway
    Push(Push),
    /// The gateway's liveness changed
    Availability {
        /// New state
        availability: Availability,
        /// When the transition was observed
        at: DateTime<Utc>,
    },
}

impl Notification {
    /// Creates an availability notification stamped with the current time
    pub fn availability(availability: Availability) -> Self {
        Notification::Availability {
            availability,
            at: Utc::now(),
        }
    }

    /// Event name of this notification
    pub fn kind(&self) -> &EventKind {
        match self {
            Notification::Push(push) => &push.kind,
            Notification::Availability { .. } => &AVAILABILITY_KIND,
        }
    }

    /// Source device ID; `None` for availability events
    pub fn sid(&self) -> Option<&str> {
        match self {
            Notification::Push(push) => Some(&push.sid),
            Notification::Availability { .. } => None,
        }
    }

    /// Device model; `None` for availability events
    pub fn model(&self) -> Option<&str> {
        match self {
            Notification::Push(push) => Some(&push.model),
            Notification::Availability { .. } => None,
        }
    }

    /// Payload; empty for availability events
    pub fn params(&self) -> Option<&Params> {
        match self {
            Notification::Push(push) => Some(&push.params),
            Notification::Availability { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = Request::new("set_rgb").with_params(json!([4278190335u32]));
        assert_eq!(request.method(), Some("set_rgb"));
        assert!(!request.is_ping());
        assert_eq!(request.body()["params"], json!([4278190335u32]));
        assert!(Request::ping().is_ping());
    }

    #[test]
    fn test_params_normalization() {
        assert!(normalize_params(None).is_empty());
        assert!(normalize_params(Some(json!([]))).is_empty());
        assert!(normalize_params(Some(Value::Null)).is_empty());

        let unwrapped = normalize_params(Some(json!([{"rgb": 1}])));
        assert_eq!(unwrapped["rgb"], json!(1));

        let scalar = normalize_params(Some(json!(["on"])));
        assert_eq!(scalar["data"], json!("on"));

        let bare = normalize_params(Some(json!(42)));
        assert_eq!(bare["data"], json!(42));

        let first = normalize_params(Some(json!(["a", "b"])));
        assert_eq!(first["data"], json!("a"));
    }

    #[test]
    fn test_result_normalization() {
        assert_eq!(normalize_result(json!(["ok"])), json!("ok"));
        assert_eq!(normalize_result(json!([])), json!("unknown"));
        assert_eq!(normalize_result(json!(17)), json!(17));
    }

    #[test]
    fn test_message_defaults_and_kind() {
        let push = Message::from_value(json!({"method": "props", "params": {"illumination": 300}})).unwrap();
        assert_eq!(push.kind(), MessageKind::Push);
        assert_eq!(push.model, GATEWAY_MODEL);
        assert_eq!(push.sid, GATEWAY_SID);
        assert_eq!(push.id, None);

        let response = Message::from_value(json!({"id": 9, "result": ["ok"]})).unwrap();
        assert_eq!(response.kind(), MessageKind::Response);
        assert_eq!(response.id, Some(9));
        assert_eq!(response.result, Some(json!("ok")));

        let neither = Message::from_value(json!({"id": 3})).unwrap();
        assert_eq!(neither.kind(), MessageKind::Invalid);

        assert!(Message::from_value(json!("ok")).is_none());
    }

    #[test]
    fn test_method_classification() {
        assert_eq!(classify_method("internal.PONG"), MethodRoute::Internal);
        assert_eq!(classify_method("_sync.neighborDevInfo"), MethodRoute::Ignored);
        assert_eq!(
            classify_method("event.motion"),
            MethodRoute::Dispatch(EventKind::Event("event.motion".to_string()))
        );
        assert_eq!(classify_method("_otc.log"), MethodRoute::Dispatch(EventKind::Metadata));
        assert_eq!(classify_method("props"), MethodRoute::Dispatch(EventKind::Values));
        assert_eq!(classify_method("mystery"), MethodRoute::Unknown);
        assert_eq!(EventKind::Values.as_str(), "internal.values");
    }

    #[test]
    fn test_notification_accessors() {
        let notification = Notification::availability(Availability::Unavailable);
        assert_eq!(notification.kind().as_str(), EVENT_AVAILABILITY);
        assert_eq!(notification.sid(), None);
        assert_eq!(notification.params(), None);
    }

    #[test]
    fn test_call_result() {
        assert_eq!(CallResult::Value(json!("ok")).as_str(), Some("ok"));
        assert!(CallResult::NoResult.is_no_result());
        assert_eq!(CallResult::NoResult.value(), None);
    }
}
