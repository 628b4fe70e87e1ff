// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pure usage → USD mapping.
//!
//! Pricing comes from the bundled catalog.  Unknown models and unreported
//! token counts contribute zero; the result is always non-negative.  The
//! streaming core calls this once per call, the tool loop once per step.

use crate::catalog::{self, LARGE_IMAGE_EDGE_PX};
use crate::content::Usage;

const MTOK: f64 = 1_000_000.0;

/// Cost of one call in USD.
///
/// `response_tokens` is the provider's output total with reasoning included
/// (normalization guarantees this), so the output rate applies to it alone —
/// `thinking_tokens` is an informational subset, not an extra charge.
/// Cached prompt tokens are billed at the cached rate and removed from the
/// uncached prompt count.
pub fn cost_usd(
    model_id: &str,
    usage: &Usage,
    response_image_count: u32,
    image_longest_edge_px: Option<u32>,
) -> f64 {
    let mut total = 0.0;

    if let Some(entry) = catalog::lookup(model_id) {
        let prompt = usage.prompt_tokens.unwrap_or(0);
        let cached = usage.cached_tokens.unwrap_or(0).min(prompt);
        let uncached = prompt - cached;
        let output = usage.response_tokens.unwrap_or(0);

        let cached_rate = entry.cached_input_per_mtok.unwrap_or(entry.input_per_mtok);
        total += uncached as f64 / MTOK * entry.input_per_mtok;
        total += cached as f64 / MTOK * cached_rate;
        total += output as f64 / MTOK * entry.output_per_mtok;

        if let Some(tool_tokens) = usage.tool_use_prompt_tokens {
            total += tool_tokens as f64 / MTOK * entry.input_per_mtok;
        }
    }

    if response_image_count > 0 {
        if let Some(entry) = catalog::lookup_image(model_id) {
            let mut per_image = entry.output_per_image;
            if image_longest_edge_px.is_some_and(|px| px > LARGE_IMAGE_EDGE_PX) {
                per_image *= entry.large_image_multiplier;
            }
            total += response_image_count as f64 * per_image;
        }
    }

    total.max(0.0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u64, cached: u64, output: u64) -> Usage {
        Usage {
            prompt_tokens: Some(prompt),
            cached_tokens: Some(cached),
            response_tokens: Some(output),
            ..Default::default()
        }
    }

    #[test]
    fn known_model_uses_catalog_rates() {
        // gpt-5: 1.25 in / 0.125 cached / 10.0 out per MTok.
        let cost = cost_usd("gpt-5", &usage(1_000_000, 0, 1_000_000), 0, None);
        assert!((cost - 11.25).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_are_discounted() {
        let all_uncached = cost_usd("gpt-5", &usage(1_000_000, 0, 0), 0, None);
        let all_cached = cost_usd("gpt-5", &usage(1_000_000, 1_000_000, 0), 0, None);
        assert!((all_uncached - 1.25).abs() < 1e-9);
        assert!((all_cached - 0.125).abs() < 1e-9);
    }

    #[test]
    fn cached_count_never_exceeds_prompt_count() {
        // A provider reporting more cached than prompt tokens must not push
        // the uncached count negative.
        let cost = cost_usd("gpt-5", &usage(100, 500, 0), 0, None);
        assert!(cost >= 0.0);
    }

    #[test]
    fn unknown_tokens_contribute_zero() {
        let cost = cost_usd("gpt-5", &Usage::default(), 0, None);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let cost = cost_usd("gpt-99-imaginary", &usage(1000, 0, 1000), 0, None);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn thinking_tokens_are_not_double_billed() {
        let without = usage(0, 0, 1_000_000);
        let mut with = without.clone();
        with.thinking_tokens = Some(400_000);
        assert_eq!(
            cost_usd("gpt-5", &without, 0, None),
            cost_usd("gpt-5", &with, 0, None)
        );
    }

    #[test]
    fn image_pricing_by_count_and_size() {
        let base = cost_usd("gemini-2.5-flash-image", &Usage::default(), 2, Some(1024));
        assert!((base - 2.0 * 0.039).abs() < 1e-9);
        let large = cost_usd("gemini-2.5-flash-image", &Usage::default(), 2, Some(2048));
        assert!((large - 2.0 * 0.039 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_images_ignores_image_pricing() {
        assert_eq!(
            cost_usd("gemini-2.5-flash-image", &Usage::default(), 0, Some(2048)),
            0.0
        );
    }
}
