//! Shallow payload reshaping between formats.
//!
//! Unlike a full translation this keeps the payload as-is apart from the
//! role vocabulary and the system prompt field, which each format spells
//! differently. Used for payloads that are already structurally close to
//! the target.

use gateway_core::ApiFormat;
use serde_json::Value;

const SYSTEM_FIELDS: [&str; 3] = ["system", "system_instruction", "systemInstruction"];

/// Reshape a JSON payload from one format's conventions to another's.
///
/// - Gemini uses `model` where the others use `assistant`; roles are swapped
///   in `messages` and `contents` when either side is Gemini.
/// - System prompt fields the target does not understand are stripped:
///   everything for OpenAI, `system_instruction` for Anthropic, `system`
///   for Gemini.
pub fn reshape_payload(mut payload: Value, from: ApiFormat, to: ApiFormat) -> Value {
    if from == to {
        return payload;
    }

    let swap = match (from, to) {
        (_, ApiFormat::Gemini) => Some(("assistant", "model")),
        (ApiFormat::Gemini, _) => Some(("model", "assistant")),
        _ => None,
    };
    if let Some((old, new)) = swap {
        for key in ["messages", "contents"] {
            if let Some(items) = payload.get_mut(key).and_then(Value::as_array_mut) {
                for item in items {
                    if item.get("role").and_then(Value::as_str) == Some(old) {
                        item["role"] = Value::String(new.to_string());
                    }
                }
            }
        }
    }

    if let Some(obj) = payload.as_object_mut() {
        let strip: &[&str] = match to {
            ApiFormat::OpenAI => &SYSTEM_FIELDS,
            ApiFormat::Anthropic => &SYSTEM_FIELDS[1..],
            ApiFormat::Gemini => &SYSTEM_FIELDS[..1],
        };
        for field in strip {
            obj.remove(*field);
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_when_formats_match() {
        let payload = json!({"system": "x", "messages": [{"role": "assistant"}]});
        assert_eq!(
            reshape_payload(payload.clone(), ApiFormat::Anthropic, ApiFormat::Anthropic),
            payload
        );
    }

    #[test]
    fn test_roles_swap_for_gemini() {
        let payload = json!({"contents": [{"role": "user"}, {"role": "assistant"}], "system": "s"});
        let out = reshape_payload(payload, ApiFormat::Anthropic, ApiFormat::Gemini);
        assert_eq!(out["contents"][1]["role"], "model");
        assert!(out.get("system").is_none());

        let back = reshape_payload(out, ApiFormat::Gemini, ApiFormat::OpenAI);
        assert_eq!(back["contents"][1]["role"], "assistant");
    }

    #[test]
    fn test_system_fields_stripped_per_target() {
        let payload = json!({"system": "a", "system_instruction": "b", "messages": []});

        let openai = reshape_payload(payload.clone(), ApiFormat::Anthropic, ApiFormat::OpenAI);
        assert!(openai.get("system").is_none() && openai.get("system_instruction").is_none());

        let anthropic = reshape_payload(payload, ApiFormat::OpenAI, ApiFormat::Anthropic);
        assert_eq!(anthropic["system"], "a");
        assert!(anthropic.get("system_instruction").is_none());
    }
}
