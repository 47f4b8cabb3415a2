//! The completion provider contract consumed by alternative generation and
//! goal decomposition.
//!
//! Only this minimal surface is relied on; concrete backends live outside
//! the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Per-request knobs. Backends may ignore fields they do not support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a JSON-only reply.
    pub json: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system: None,
            max_tokens: 2048,
            temperature: 0.2,
            json: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// A text-generation backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short identifier, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError>;

    /// Embed `text` as a vector. Providers without embeddings keep the
    /// default, which rejects the call.
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_owned(),
            operation: "embed".to_owned(),
        })
    }
}

// Compile-time assertion: CompletionProvider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn CompletionProvider) {}
};

/// Strip a surrounding Markdown code fence from a model reply.
pub(crate) fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl CompletionProvider for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<Completion, ProviderError> {
            Ok(Completion {
                content: String::new(),
                model: "none".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
            })
        }
    }

    #[tokio::test]
    async fn embed_is_unsupported_by_default() {
        let err = Silent.embed("hello").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Unsupported {
                provider: "silent".into(),
                operation: "embed".into()
            }
        );
    }

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
    }
}
