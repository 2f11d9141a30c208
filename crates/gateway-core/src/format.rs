//! Wire formats understood by the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A provider or caller wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// OpenAI chat completions schema
    #[serde(alias = "openai-compatible")]
    OpenAI,
    /// Anthropic messages schema
    Anthropic,
    /// Google Gemini `generateContent` schema
    #[serde(alias = "google")]
    Gemini,
}

impl ApiFormat {
    /// All supported formats
    pub const ALL: [Self; 3] = [Self::OpenAI, Self::Anthropic, Self::Gemini];

    /// Lowercase identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Whether the format carries a dedicated system prompt field
    #[must_use]
    pub fn has_system_field(&self) -> bool {
        !matches!(self, Self::OpenAI)
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(Self::OpenAI),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(format!("unknown api format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("OpenAI".parse::<ApiFormat>(), Ok(ApiFormat::OpenAI));
        assert_eq!("claude".parse::<ApiFormat>(), Ok(ApiFormat::Anthropic));
        assert_eq!("google".parse::<ApiFormat>(), Ok(ApiFormat::Gemini));
        assert!("cohere".parse::<ApiFormat>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = serde_json::to_string(&ApiFormat::Gemini).unwrap();
        assert_eq!(json, "\"gemini\"");
        let parsed: ApiFormat = serde_json::from_str("\"google\"").unwrap();
        assert_eq!(parsed, ApiFormat::Gemini);
    }
}
