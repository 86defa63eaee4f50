//! Node error text normalization.
//!
//! Gateways return rejection reasons hex- or base64-encoded depending on the
//! endpoint. Everything the client surfaces goes through [`decode_message`].

use base64::Engine;
use serde_json::Value;

use crate::http::TransportError;
use crate::tron::types::TronError;

/// Decode a hex or base64 node message when it decodes to printable text.
pub fn decode_message(raw: &str) -> String {
    let trimmed = raw.trim();
    decode_hex_text(trimmed)
        .or_else(|| decode_base64_text(trimmed))
        .unwrap_or_else(|| trimmed.to_string())
}

/// Pull the human-readable error out of a node response, if it carries one.
///
/// Looks at `Error`, `message`, `result.message` and `resMessage`, and prefixes
/// the node's `code` when present.
pub fn node_error_text(value: &Value) -> Option<String> {
    let message = ["/Error", "/message", "/result/message", "/resMessage"]
        .iter()
        .find_map(|pointer| value.pointer(pointer).and_then(Value::as_str))
        .map(decode_message)
        .filter(|m| !m.is_empty());

    let code = value
        .get("code")
        .and_then(Value::as_str)
        .filter(|code| *code != "SUCCESS");

    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
        (None, Some(message)) => Some(message),
        (Some(code), None) => Some(code.to_string()),
        (None, None) => None,
    }
}

/// Make transport failures readable, decoding JSON error bodies.
pub fn transport_error(err: TransportError) -> TronError {
    match err {
        TransportError::Status { status, body } => {
            let body = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| node_error_text(&value))
                .unwrap_or_else(|| decode_message(&body));
            TronError::Transport(TransportError::Status { status, body })
        }
        other => TronError::Transport(other),
    }
}

fn decode_hex_text(s: &str) -> Option<String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() < 2 || digits.len() % 2 != 0 {
        return None;
    }
    let bytes = alloy::primitives::hex::decode(digits).ok()?;
    printable(bytes)
}

fn decode_base64_text(s: &str) -> Option<String> {
    if s.len() < 4 || s.len() % 4 != 0 {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    printable(bytes)
}

fn printable(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text_like = bytes
        .iter()
        .all(|b| matches!(b, 0x20..=0x7e | b'\n' | b'\r' | b'\t'));
    if !text_like {
        return None;
    }
    String::from_utf8(bytes).ok().map(|s| s.trim().to_string())
}
