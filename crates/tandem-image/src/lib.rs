// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Image batch generation with per-image grading.
//!
//! [`generate_images`] produces one image per prompt, preserving prompt
//! order.  Each attempt sends a single multi-part request (style guidance,
//! style anchors, the still-open prompts), extracts the produced images, and
//! grades every candidate against its prompt with a separate text-model
//! call.  Passing images fill their slots; failing prompts carry into the
//! next attempt with a regeneration note.  The grading model id is injected
//! by the caller, never hard-coded here.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tandem_model::{
    generate_json, generate_text, AbortHandle, Content, JsonRequest, LlmError, Part, Prompt,
    Role, TextRequest,
};

pub use error::ImageBatchError;

mod error;

/// An opaque generated image: base64 payload plus mime type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlob {
    pub mime_type: String,
    /// Base64-encoded bytes (no data-URL prefix).
    pub data: String,
}

impl ImageBlob {
    /// Render as a `data:<mime>;base64,<b64>` URL.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    fn from_part(part: &Part) -> Option<Self> {
        match part {
            Part::InlineData { data, mime_type } => Some(Self {
                mime_type: mime_type.clone().unwrap_or_else(|| "image/png".into()),
                data: data.clone(),
            }),
            Part::Text { .. } => None,
        }
    }

    fn to_part(&self) -> Part {
        Part::inline_data(self.data.clone(), Some(self.mime_type.clone()))
    }
}

#[derive(Clone)]
pub struct ImageBatchRequest {
    /// Style guidance prepended to every attempt.
    pub style_prompt: String,
    /// Reference images sent as style anchors.
    pub style_images: Vec<ImageBlob>,
    /// One slot per prompt; output preserves this order.
    pub image_prompts: Vec<String>,
    /// Instructions for the grading model.
    pub image_grading_prompt: String,
    /// Image-generation model id.
    pub model: String,
    /// Text model used to grade candidates.
    pub grading_model: String,
    /// Attempts across the whole batch (default 4).
    pub max_attempts: u32,
    pub abort: Option<AbortHandle>,
}

impl ImageBatchRequest {
    pub fn new(
        model: impl Into<String>,
        grading_model: impl Into<String>,
        style_prompt: impl Into<String>,
        image_prompts: Vec<String>,
        image_grading_prompt: impl Into<String>,
    ) -> Self {
        Self {
            style_prompt: style_prompt.into(),
            style_images: Vec::new(),
            image_prompts,
            image_grading_prompt: image_grading_prompt.into(),
            model: model.into(),
            grading_model: grading_model.into(),
            max_attempts: 4,
            abort: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum Grade {
    Pass,
    Fail,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GradeResponse {
    grade: Grade,
}

/// Generate one image per prompt, in order.
pub async fn generate_images(
    req: ImageBatchRequest,
) -> Result<Vec<ImageBlob>, ImageBatchError> {
    if req.image_prompts.is_empty() {
        return Err(ImageBatchError::NoPrompts);
    }
    let max_attempts = req.max_attempts.max(1);

    let mut slots: Vec<Option<ImageBlob>> = vec![None; req.image_prompts.len()];
    // Indices of prompts still without a passing image.
    let mut open: Vec<usize> = (0..req.image_prompts.len()).collect();
    let mut retry_note: Option<String> = None;

    for attempt in 1..=max_attempts {
        if let Some(abort) = &req.abort {
            if abort.is_aborted() {
                return Err(LlmError::cancelled(abort.reason()).into());
            }
        }

        let produced = run_generation(&req, &open, retry_note.as_deref()).await?;
        if produced.is_empty() {
            return Err(ImageBatchError::NoImages { attempt });
        }
        debug!(attempt, produced = produced.len(), open = open.len(), "grading image batch");

        // Grade each candidate against its slot's prompt, concurrently.
        let graded = futures::future::join_all(produced.iter().zip(open.iter()).map(
            |(image, &slot)| {
                let req = &req;
                async move {
                    grade_image(req, image, &req.image_prompts[slot]).await
                }
            },
        ))
        .await;

        let mut still_open = Vec::new();
        for ((image, &slot), grade) in produced.iter().zip(open.iter()).zip(graded) {
            match grade? {
                Grade::Pass => slots[slot] = Some(image.clone()),
                Grade::Fail => still_open.push(slot),
            }
        }
        // Prompts with no candidate this attempt stay open too.
        still_open.extend(open.iter().copied().skip(produced.len()));
        open = still_open;

        if open.is_empty() {
            break;
        }
        retry_note = Some(format!(
            "The previous attempt produced images that failed grading for {} prompt(s). \
             Regenerate them, following each description more closely.",
            open.len()
        ));
    }

    if !open.is_empty() {
        return Err(ImageBatchError::GradingExhausted {
            remaining: open.len(),
            attempts: max_attempts,
        });
    }
    Ok(slots.into_iter().map(|s| s.expect("all slots filled")).collect())
}

/// Batched variant: split the prompt list into fixed-size groups, carrying
/// up to `overlap` images from the previous group as extra style anchors so
/// the batches stay visually consistent.
pub async fn generate_images_batched(
    mut req: ImageBatchRequest,
    batch_size: usize,
    overlap: usize,
) -> Result<Vec<ImageBlob>, ImageBatchError> {
    if req.image_prompts.is_empty() {
        return Err(ImageBatchError::NoPrompts);
    }
    let batch_size = batch_size.max(1);
    let all_prompts = std::mem::take(&mut req.image_prompts);
    let mut results: Vec<ImageBlob> = Vec::with_capacity(all_prompts.len());

    for group in all_prompts.chunks(batch_size) {
        let mut group_req = req.clone();
        group_req.image_prompts = group.to_vec();
        if overlap > 0 {
            let anchors: Vec<ImageBlob> = results
                .iter()
                .rev()
                .take(overlap)
                .rev()
                .cloned()
                .collect();
            group_req.style_images.extend(anchors);
        }
        results.extend(generate_images(group_req).await?);
    }
    Ok(results)
}

/// One generation call covering the currently open prompts.
async fn run_generation(
    req: &ImageBatchRequest,
    open: &[usize],
    retry_note: Option<&str>,
) -> Result<Vec<ImageBlob>, ImageBatchError> {
    let mut parts: Vec<Part> = vec![Part::text(req.style_prompt.clone())];
    for anchor in &req.style_images {
        parts.push(anchor.to_part());
    }
    if let Some(note) = retry_note {
        parts.push(Part::text(note.to_string()));
    }
    for (position, &slot) in open.iter().enumerate() {
        parts.push(Part::text(format!(
            "Image {}: {}",
            position + 1,
            req.image_prompts[slot]
        )));
    }

    let mut text_req = TextRequest::new(
        req.model.clone(),
        Prompt::messages(vec![Content {
            role: Role::User,
            parts,
        }]),
    );
    text_req.abort = req.abort.clone();
    let result = generate_text(text_req).await?;

    Ok(result
        .images
        .iter()
        .filter_map(ImageBlob::from_part)
        .collect())
}

/// Grade one candidate against its prompt with the injected text model.
async fn grade_image(
    req: &ImageBatchRequest,
    image: &ImageBlob,
    prompt: &str,
) -> Result<Grade, ImageBatchError> {
    let content = Content {
        role: Role::User,
        parts: vec![
            Part::text(req.image_grading_prompt.clone()),
            image.to_part(),
            Part::text(format!("Target description: {prompt}")),
        ],
    };
    let mut json_req = JsonRequest::new(
        req.grading_model.clone(),
        Prompt::messages(vec![content]),
    );
    json_req.abort = req.abort.clone();
    let response: GradeResponse = generate_json(json_req).await?;
    Ok(response.grade)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
