//! String-level rewrite of a payload's top-level `model` field.
//!
//! The payload is scanned, not re-parsed, so every other byte (key order,
//! number formatting, whitespace) survives untouched.

use bytes::Bytes;
use gateway_core::{GatewayError, GatewayResult};

/// Byte range of a JSON string literal, quotes included
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// End of the JSON value starting at `start`, whatever its type
fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
    match bytes.get(start)? {
        b'"' => string_end(bytes, start),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut i = start;
            while i < bytes.len() {
                match bytes[i] {
                    b'"' => {
                        i = string_end(bytes, i)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(i + 1);
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            None
        }
        _ => {
            let len = bytes[start..]
                .iter()
                .position(|b| matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace())
                .unwrap_or(bytes.len() - start);
            (len > 0).then_some(start + len)
        }
    }
}

/// Span of the value of the top-level `"model"` key
fn find_model_value(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut expecting_key = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                depth += 1;
                expecting_key = depth == 1;
                i += 1;
            }
            b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b',' => {
                expecting_key = depth == 1;
                i += 1;
            }
            b'"' => {
                let end = string_end(bytes, i)?;
                if depth == 1 && expecting_key {
                    expecting_key = false;
                    let after_key = skip_whitespace(bytes, end);
                    if &bytes[i..end] == b"\"model\"" && bytes.get(after_key) == Some(&b':') {
                        let value_start = skip_whitespace(bytes, after_key + 1);
                        return Some((value_start, value_end(bytes, value_start)?));
                    }
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    None
}

/// Replace (or insert) the top-level `model` field of a JSON object payload
///
/// # Errors
/// Returns `GatewayError::Validation` when the payload is not a JSON object
pub fn patch_model(payload: &[u8], model: &str) -> GatewayResult<Bytes> {
    let literal = serde_json::to_string(model)
        .map_err(|e| GatewayError::internal(format!("cannot encode model name: {e}")))?;

    if let Some((start, end)) = find_model_value(payload) {
        let mut out = Vec::with_capacity(payload.len() + literal.len());
        out.extend_from_slice(&payload[..start]);
        out.extend_from_slice(literal.as_bytes());
        out.extend_from_slice(&payload[end..]);
        return Ok(Bytes::from(out));
    }

    let open = skip_whitespace(payload, 0);
    if payload.get(open) != Some(&b'{') {
        return Err(GatewayError::validation(
            "request body must be a JSON object",
            None,
            "invalid_json",
        ));
    }
    let rest = skip_whitespace(payload, open + 1);
    let separator = if payload.get(rest) == Some(&b'}') { "" } else { "," };

    let mut out = Vec::with_capacity(payload.len() + literal.len() + 10);
    out.extend_from_slice(&payload[..=open]);
    out.extend_from_slice(b"\"model\":");
    out.extend_from_slice(literal.as_bytes());
    out.extend_from_slice(separator.as_bytes());
    out.extend_from_slice(&payload[open + 1..]);
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patched(input: &str, model: &str) -> String {
        String::from_utf8(patch_model(input.as_bytes(), model).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_replaces_top_level_model_only() {
        let input = r#"{"metadata":{"model":"inner"}, "model" : "smart", "temperature":0.70}"#;
        assert_eq!(
            patched(input, "gpt-4o"),
            r#"{"metadata":{"model":"inner"}, "model" : "gpt-4o", "temperature":0.70}"#
        );
    }

    #[test]
    fn test_ignores_model_inside_strings_and_arrays() {
        let input = r#"{"messages":[{"content":"\"model\": \"x\""}],"model":"smart"}"#;
        assert_eq!(
            patched(input, "claude-3-5-haiku"),
            r#"{"messages":[{"content":"\"model\": \"x\""}],"model":"claude-3-5-haiku"}"#
        );
    }

    #[test]
    fn test_value_named_model_is_not_a_key() {
        let input = r#"{"role":"model","model":"smart"}"#;
        assert_eq!(patched(input, "m"), r#"{"role":"model","model":"m"}"#);
    }

    #[test]
    fn test_inserts_when_missing() {
        assert_eq!(patched(r#"{"a":1}"#, "m"), r#"{"model":"m","a":1}"#);
        assert_eq!(patched("{ }", "m"), r#"{"model":"m" }"#);
    }

    #[test]
    fn test_escapes_model_name() {
        assert_eq!(patched(r#"{"model":"x"}"#, "we\"ird"), r#"{"model":"we\"ird"}"#);
    }

    #[test]
    fn test_replaces_non_string_model() {
        assert_eq!(patched(r#"{"model":42,"x":1}"#, "m1"), r#"{"model":"m1","x":1}"#);
        assert_eq!(patched(r#"{"model": null }"#, "m1"), r#"{"model": "m1" }"#);
        assert_eq!(patched(r#"{"x":true,"model":false}"#, "m1"), r#"{"x":true,"model":"m1"}"#);
        assert_eq!(
            patched(r#"{"model":{"name":"}"},"x":[1]}"#, "m1"),
            r#"{"model":"m1","x":[1]}"#
        );
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(patch_model(b"[1,2]", "m").is_err());
    }
}
