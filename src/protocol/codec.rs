use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::core::{Error, Result};
use super::message::{Message, OutboundCall};

/// Codec for the gateway's datagram format.
///
/// Every datagram is a self-contained batch: one or more JSON objects glued
/// together without separators, sometimes followed by a single NUL byte.
#[derive(Clone, Default)]
pub struct GatewayCodec;

impl GatewayCodec {
    /// Creates a new codec
    pub fn new() -> Self {
        GatewayCodec
    }

    /// Decodes a whole datagram. Malformed JSON fails the entire batch.
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Vec<Message>> {
        let repaired = repair(datagram)?;
        let values: Vec<Value> = serde_json::from_str(&repaired)
            .map_err(|e| Error::decode(format!("Bad JSON received: {}", e)))?;

        let mut messages = Vec::with_capacity(values.len());
        for value in values {
            match Message::from_value(value) {
                Some(message) => messages.push(message),
                None => warn!("Skipping non-object entry in datagram"),
            }
        }
        Ok(messages)
    }

    /// Builds the JSON object sent for a call
    pub fn frame(call: OutboundCall) -> Map<String, Value> {
        let OutboundCall { id, request } = call;
        let body = request.body().clone();
        match id {
            Some(id) if !request.is_ping() => {
                let mut framed = body;
                framed.insert("id".to_string(), Value::from(id));
                framed
            }
            _ => body,
        }
    }
}

/// Strips NUL padding and turns back-to-back objects into a JSON array
fn repair(datagram: &[u8]) -> Result<String> {
    let trimmed = match datagram.split_last() {
        Some((&0, rest)) => rest,
        _ => datagram,
    };
    let text = std::str::from_utf8(trimmed)
        .map_err(|e| Error::decode(format!("Datagram is not UTF-8: {}", e)))?;

    let mut repaired = String::with_capacity(text.len() + 8);
    repaired.push('[');
    repaired.push_str(&text.replace("}{", "},{"));
    repaired.push(']');
    Ok(repaired)
}

impl Decoder for GatewayCodec {
    type Item = Vec<Message>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        // A datagram is never split across reads, so consume all of it
        let datagram = src.split();
        self.decode_datagram(&datagram).map(Some)
    }
}

impl Encoder<OutboundCall> for GatewayCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundCall, dst: &mut BytesMut) -> Result<()> {
        let body = Value::Object(Self::frame(item));
        serde_json::to_writer(dst.writer(), &body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageKind, Request};
    use serde_json::json;

    fn encode(call: OutboundCall) -> BytesMut {
        let mut codec = GatewayCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(call, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_heartbeat_has_no_id() {
        let bytes = encode(OutboundCall::heartbeat());
        assert_eq!(&bytes[..], br#"{"method":"internal.PING"}"#);
    }

    #[test]
    fn test_request_gets_id() {
        let request = Request::new("get_prop").with_params(json!(["gateway_volume"]));
        let bytes = encode(OutboundCall::new(42, request));
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["id"], json!(42));
        assert_eq!(value["method"], json!("get_prop"));
        assert_eq!(value["params"], json!(["gateway_volume"]));
    }

    #[test]
    fn test_request_id_overrides_caller_id() {
        let request = Request::new("toggle_light").with_field("id", json!(1));
        let bytes = encode(OutboundCall::new(7, request));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], json!(7));
    }

    #[test]
    fn test_gateway_side_round_trip() {
        // The gateway echoes method and params back as a push
        let params = json!({"rgb": 4278190335u32, "brightness": 50});
        let request = Request::new("set_rgb").with_params(params.clone());
        let bytes = encode(OutboundCall::new(3, request));

        let messages = GatewayCodec::new().decode_datagram(&bytes).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].method.as_deref(), Some("set_rgb"));
        assert_eq!(Value::Object(messages[0].params.clone()), params);
        assert_eq!(messages[0].id, Some(3));
    }

    #[test]
    fn test_concatenated_objects() {
        let datagram = br#"{"method":"event.motion","sid":"a"}{"method":"props","sid":"b","params":{"lux":3}}{"id":4,"result":"ok"}"#;
        let messages = GatewayCodec::new().decode_datagram(datagram).unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].sid, "a");
        assert_eq!(messages[1].sid, "b");
        assert_eq!(messages[1].params["lux"], json!(3));
        assert_eq!(messages[2].kind(), MessageKind::Response);
    }

    #[test]
    fn test_null_padding_and_list_result() {
        let messages = GatewayCodec::new()
            .decode_datagram(b"{\"id\":5,\"result\":[\"ok\"]}\x00")
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(5));
        assert_eq!(messages[0].result, Some(json!("ok")));
    }

    #[test]
    fn test_empty_result_is_unknown() {
        let messages = GatewayCodec::new()
            .decode_datagram(br#"{"id":7,"result":[]}"#)
            .unwrap();
        assert_eq!(messages[0].result, Some(json!("unknown")));
    }

    #[test]
    fn test_malformed_datagram_is_dropped_whole() {
        let codec = GatewayCodec::new();
        let result = codec.decode_datagram(br#"{"method":"props"}{"method":"#);
        assert!(matches!(result, Err(Error::Decode(_))));

        let result = codec.decode_datagram(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_decoder_consumes_datagram() {
        let mut codec = GatewayCodec::new();
        let mut buf = BytesMut::from(&br#"{"method":"event.click"}"#[..]);

        let batch = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
