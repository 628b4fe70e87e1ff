// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use tandem_model::LlmError;

#[derive(Debug, Error)]
pub enum ImageBatchError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("image batch requires at least one prompt")]
    NoPrompts,

    #[error("model produced no images on attempt {attempt}")]
    NoImages { attempt: u32 },

    #[error("{remaining} image(s) still failing after {attempts} attempts")]
    GradingExhausted { remaining: usize, attempts: u32 },
}
