//! Messages exchanged with remote peers.
//!
//! Every overlay message payload is a JSON object whose `type` field selects
//! one of three variants. Bodies of responses travel base64-encoded in
//! `body_b64`.
//!
//! ```json
//! {"id":"5f0c…","type":"elev.query","dataset":"mapzen","geohashes":["9q8yyxk6p"]}
//! {"id":"5f0c…","type":"http.request","method":"GET","url":"/v1/mapzen?locations=9q8yyxk6p"}
//! {"id":"5f0c…","type":"http.response","status":200,"headers":{},"body_b64":"e30=","duration_ms":12}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::location::{GeohashInput, LocationInput};

/// `type` value of an elevation query.
pub const ELEV_QUERY: &str = "elev.query";
/// `type` value of a proxied HTTP request.
pub const HTTP_REQUEST: &str = "http.request";
/// `type` value of a response.
pub const HTTP_RESPONSE: &str = "http.response";

/// A message carried in an overlay payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "elev.query")]
    ElevQuery(ElevQuery),
    #[serde(rename = "http.request")]
    HttpRequest(HttpRequest),
    #[serde(rename = "http.response")]
    HttpResponse(ResponseEnvelope),
}

impl Envelope {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// An elevation query in geohash or lat/lng form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElevQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geohashes: Option<GeohashInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<LocationInput>,
}

/// A proxied `GET /v1/<dataset>?locations=...` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A response routed back to the requesting peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, rename = "body_b64", with = "body_b64")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ResponseEnvelope {
    /// A JSON error reply: `{"error": message}`.
    pub fn error(id: impl Into<String>, status: u16, message: impl AsRef<str>) -> Self {
        Self {
            id: id.into(),
            status,
            headers: json_headers(),
            body: error_body(message.as_ref()),
            duration_ms: 0,
        }
    }

    /// Body decoded as UTF-8, lossily; `None` when the body is empty.
    pub fn body_utf8(&self) -> Option<String> {
        if self.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.body).into_owned())
        }
    }

    /// Serialize as a tagged `http.response` message.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        // Envelope needs an owned value to tag
        Envelope::HttpResponse(self.clone()).to_bytes()
    }
}

/// `{"content-type": "application/json"}`.
pub fn json_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("content-type".to_string(), "application/json".to_string())])
}

/// `{"error": message}` as bytes.
pub fn error_body(message: &str) -> Vec<u8> {
    serde_json::json!({ "error": message }).to_string().into_bytes()
}

/// Base64 encoding with the standard alphabet and padding.
pub fn encode_b64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64, ignoring surrounding whitespace.
pub fn decode_b64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s.trim())
}

mod body_b64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_b64(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::decode_b64(&s).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
