use crate::error::BrokerError;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message body as seen by middleware and host callbacks.
///
/// Bodies arriving with `content-type: application/json` are decoded to
/// `Json` before the send pipeline runs; every other content type passes
/// through as text (or raw bytes when not valid UTF-8).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn decode(
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Self, BrokerError> {
        if is_json(content_type) {
            return serde_json::from_slice(body).map(Payload::Json).map_err(
                |err| BrokerError::Protocol(format!("invalid JSON body: {err}")),
            );
        }
        Ok(match String::from_utf8(body.to_vec()) {
            Ok(text) => Payload::Text(text),
            Err(raw) => Payload::Bytes(raw.into_bytes()),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.clone().into_bytes(),
            Payload::Bytes(bytes) => bytes.clone(),
            // serializing a serde_json::Value cannot fail
            Payload::Json(value) => {
                serde_json::to_vec(value).unwrap_or_default()
            }
        }
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(|value| value.trim().starts_with(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}
