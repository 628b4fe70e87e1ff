// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model catalog: provider classification, wire names, context windows,
//! and pricing for known models.

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// The remote backend a model id resolves to.
///
/// Provider selection is a total function of the model id: the four public
/// prefixes are disjoint, and every later branch in the runtime dispatches on
/// this enum exhaustively.  `Mock` is the scripted in-process backend used by
/// tests; it is reserved under the `mock` prefix and is not a public provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    ChatGpt,
    Fireworks,
    Gemini,
    Mock,
}

impl Provider {
    /// Stable lowercase name used in logs, errors, and scheduler keys.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::ChatGpt => "chatgpt",
            Provider::Fireworks => "fireworks",
            Provider::Gemini => "gemini",
            Provider::Mock => "mock",
        }
    }

    /// Classify a model id into its provider.
    ///
    /// Classification is by prefix so that new models of a known family work
    /// without a catalog update; the catalog supplies metadata (wire name,
    /// pricing) when the id is listed.  Unknown ids are an
    /// `invalid_argument` error, never a guess from request shape.
    pub fn classify(model_id: &str) -> Result<Provider, LlmError> {
        if model_id.starts_with("chatgpt-") {
            return Ok(Provider::ChatGpt);
        }
        if model_id.starts_with("accounts/fireworks/") {
            return Ok(Provider::Fireworks);
        }
        if model_id.starts_with("gemini-") {
            return Ok(Provider::Gemini);
        }
        if model_id.starts_with("gpt-") || model_id.starts_with("o3") || model_id.starts_with("o4")
        {
            return Ok(Provider::OpenAi);
        }
        if model_id.starts_with("mock") {
            return Ok(Provider::Mock);
        }
        Err(LlmError::invalid_argument(format!(
            "unknown model id: '{model_id}'"
        )))
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for a single text model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    /// Public model identifier accepted by the runtime.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    pub provider: Provider,
    /// Model string sent on the wire when it differs from `id`.
    #[serde(default)]
    pub wire_id: Option<String>,
    /// Total context window in tokens.
    pub context_window: u32,
    /// Maximum output tokens per completion.
    pub max_output_tokens: u32,
    /// USD per 1M uncached prompt tokens.
    #[serde(default)]
    pub input_per_mtok: f64,
    /// USD per 1M cached prompt tokens.  Falls back to `input_per_mtok`
    /// when the provider does not discount cache hits.
    #[serde(default)]
    pub cached_input_per_mtok: Option<f64>,
    /// USD per 1M response tokens (reasoning included).
    #[serde(default)]
    pub output_per_mtok: f64,
}

/// Metadata for a single image-generation model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageModelEntry {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    /// USD per generated image at the base size tier.
    pub output_per_image: f64,
    /// Price multiplier for images whose longest edge exceeds
    /// [`LARGE_IMAGE_EDGE_PX`].
    #[serde(default = "default_large_multiplier")]
    pub large_image_multiplier: f64,
    /// Token equivalent reported per generated image, when known.
    #[serde(default)]
    pub tokens_per_image: Option<u64>,
}

fn default_large_multiplier() -> f64 {
    1.0
}

/// Longest edge (px) above which the large-image price tier applies.
pub const LARGE_IMAGE_EDGE_PX: u32 = 1024;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelEntry>,
    #[serde(default)]
    image_models: Vec<ImageModelEntry>,
}

fn catalog_file() -> &'static CatalogFile {
    use std::sync::OnceLock;
    static CATALOG: OnceLock<CatalogFile> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let yaml = include_str!("../models.yaml");
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid")
    })
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> &'static [ModelEntry] {
    &catalog_file().models
}

/// Return all image-model entries from the bundled static catalog.
pub fn static_image_catalog() -> &'static [ImageModelEntry] {
    &catalog_file().image_models
}

/// Look up a text model by its public id.
pub fn lookup(model_id: &str) -> Option<&'static ModelEntry> {
    static_catalog().iter().find(|e| e.id == model_id)
}

/// Look up an image model by its public id.
pub fn lookup_image(model_id: &str) -> Option<&'static ImageModelEntry> {
    static_image_catalog().iter().find(|e| e.id == model_id)
}

/// Classify an image-model id.  Image models form their own enumeration:
/// catalog membership first, then the `-image` marker on a Gemini id.
pub fn classify_image(model_id: &str) -> Result<Provider, LlmError> {
    if let Some(entry) = lookup_image(model_id) {
        return Ok(entry.provider);
    }
    if model_id.starts_with("gemini-") && model_id.contains("-image") {
        return Ok(Provider::Gemini);
    }
    Err(LlmError::invalid_argument(format!(
        "unknown image model id: '{model_id}'"
    )))
}

/// The model string sent on the wire for a public id.
///
/// ChatGPT-backed ids drop their `chatgpt-` prefix; everything else is sent
/// verbatim unless the catalog overrides it.
pub fn wire_model(model_id: &str) -> String {
    if let Some(entry) = lookup(model_id) {
        if let Some(wire) = &entry.wire_id {
            return wire.clone();
        }
    }
    model_id
        .strip_prefix("chatgpt-")
        .unwrap_or(model_id)
        .to_string()
}

/// True for codex-family models, which default to a lower reasoning effort.
pub fn is_codex_family(model_id: &str) -> bool {
    model_id.contains("codex")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn prefixes_are_disjoint_and_total() {
        assert_eq!(Provider::classify("gpt-5").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::classify("gpt-5-codex").unwrap(), Provider::OpenAi);
        assert_eq!(
            Provider::classify("chatgpt-gpt-5").unwrap(),
            Provider::ChatGpt
        );
        assert_eq!(
            Provider::classify("accounts/fireworks/models/deepseek-v3p1").unwrap(),
            Provider::Fireworks
        );
        assert_eq!(
            Provider::classify("gemini-2.5-flash").unwrap(),
            Provider::Gemini
        );
        assert_eq!(Provider::classify("mock-echo").unwrap(), Provider::Mock);
    }

    #[test]
    fn unknown_id_is_invalid_argument() {
        let err = Provider::classify("claude-opus-4").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn classification_never_depends_on_catalog_membership() {
        // A plausible future model of a known family classifies without a
        // catalog entry.
        assert_eq!(Provider::classify("gpt-6-turbo").unwrap(), Provider::OpenAi);
        assert_eq!(
            Provider::classify("gemini-3.0-pro").unwrap(),
            Provider::Gemini
        );
    }

    #[test]
    fn chatgpt_wire_model_drops_prefix() {
        assert_eq!(wire_model("chatgpt-gpt-5-codex"), "gpt-5-codex");
        assert_eq!(wire_model("chatgpt-gpt-5"), "gpt-5");
        assert_eq!(wire_model("gpt-5"), "gpt-5");
        assert_eq!(
            wire_model("accounts/fireworks/models/glm-4p6"),
            "accounts/fireworks/models/glm-4p6"
        );
    }

    #[test]
    fn catalog_is_non_empty_and_consistent() {
        assert!(!static_catalog().is_empty());
        for entry in static_catalog() {
            assert_eq!(
                Provider::classify(&entry.id).unwrap(),
                entry.provider,
                "{} classifies to the wrong provider",
                entry.id
            );
            assert!(entry.context_window > 0, "{} has no context window", entry.id);
        }
    }

    #[test]
    fn image_models_are_a_separate_enumeration() {
        assert_eq!(
            classify_image("gemini-2.5-flash-image").unwrap(),
            Provider::Gemini
        );
        assert!(classify_image("gpt-5").is_err());
        assert!(lookup_image("gemini-2.5-flash-image").is_some());
        assert!(lookup("gemini-2.5-flash-image").is_none());
    }

    #[test]
    fn codex_family_detection() {
        assert!(is_codex_family("gpt-5-codex"));
        assert!(is_codex_family("chatgpt-gpt-5-codex"));
        assert!(!is_codex_family("gpt-5"));
    }
}
