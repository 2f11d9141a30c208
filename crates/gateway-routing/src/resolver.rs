//! Model name to provider inference.

/// Split an explicit `provider/model` name
#[must_use]
pub fn split_provider_prefix(model: &str) -> Option<(&str, &str)> {
    let (provider, rest) = model.split_once('/')?;
    (!provider.is_empty() && !rest.is_empty()).then_some((provider, rest))
}

/// Provider ids that conventionally serve `model`, most likely first
#[must_use]
pub fn infer_providers(model: &str) -> Vec<String> {
    if let Some((provider, _)) = split_provider_prefix(model) {
        return vec![provider.to_ascii_lowercase()];
    }

    let model = model.to_ascii_lowercase();
    let provider = if model.starts_with("claude") {
        "anthropic"
    } else if model.starts_with("gemini") {
        "gemini"
    } else if model.starts_with("gpt")
        || model.starts_with("chatgpt")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
    {
        "openai"
    } else {
        return Vec::new();
    };
    vec![provider.to_string()]
}
