use axum::http::HeaderMap;
use serde_json::{Map, Value};

/// Structured view of a webhook body, used only to pull out identifiers.
/// Signatures are always checked against the raw bytes, never this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Value);

impl Payload {
    /// JSON object first; bodies that are not JSON at all are tried as
    /// `application/x-www-form-urlencoded`. Other JSON values yield an empty
    /// payload.
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => return Payload(value),
            Ok(_) => return Payload(Value::Null),
            Err(_) => {}
        }
        if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            if !pairs.is_empty() {
                let map: Map<String, Value> = pairs
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
                return Payload(Value::Object(map));
            }
        }
        Payload(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|m| m.get(name))
    }

    fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One place a value might live in a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    Header(&'static str),
    /// Top-level body field.
    Field(&'static str),
    /// JSON pointer into the body, e.g. `/data/id`.
    Pointer(&'static str),
}

impl Extractor {
    pub fn extract(&self, headers: &HeaderMap, payload: &Payload) -> Option<String> {
        let raw = match self {
            Extractor::Header(name) => headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            Extractor::Field(name) => payload.field(name).and_then(scalar_to_string),
            Extractor::Pointer(ptr) => payload.pointer(ptr).and_then(scalar_to_string),
        }?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// First non-empty match, in list order.
pub fn first_match(
    extractors: &[Extractor],
    headers: &HeaderMap,
    payload: &Payload,
) -> Option<String> {
    extractors.iter().find_map(|e| e.extract(headers, payload))
}

/// Phone numbers arrive as `+1 555 123 4567` or `+15551234567`; count them as one.
pub fn normalize_identity(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

#[derive(Debug, Clone)]
pub struct ExtractionPlan {
    pub signature: Vec<Extractor>,
    pub delivery_id: Vec<Extractor>,
    pub caller: Vec<Extractor>,
}

impl Default for ExtractionPlan {
    fn default() -> Self {
        Self {
            signature: vec![
                Extractor::Header("x-telephony-signature"),
                Extractor::Header("x-signature"),
                Extractor::Header("authorization"),
            ],
            // Body ids are covered by the signature, headers are not: a header
            // may only name the delivery when the signed body carries no id.
            delivery_id: vec![
                Extractor::Field("MessageSid"),
                Extractor::Field("message_id"),
                Extractor::Pointer("/data/id"),
                Extractor::Field("id"),
                Extractor::Header("x-message-id"),
                Extractor::Header("x-delivery-id"),
            ],
            caller: vec![
                Extractor::Field("From"),
                Extractor::Field("from"),
                Extractor::Pointer("/data/payload/from/phone_number"),
                Extractor::Field("caller"),
            ],
        }
    }
}

impl ExtractionPlan {
    pub fn signature(&self, headers: &HeaderMap, payload: &Payload) -> Option<String> {
        first_match(&self.signature, headers, payload)
    }

    pub fn delivery_id(&self, headers: &HeaderMap, payload: &Payload) -> Option<String> {
        first_match(&self.delivery_id, headers, payload)
    }

    pub fn caller(&self, headers: &HeaderMap, payload: &Payload) -> Option<String> {
        first_match(&self.caller, headers, payload)
            .map(|c| normalize_identity(&c))
            .filter(|c| !c.is_empty())
    }
}
