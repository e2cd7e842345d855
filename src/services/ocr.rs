use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::core::metrics::{OCR_PAGE_CONFIDENCE, OCR_PAGE_DURATION_MS};
use crate::domain::error::EngineError;
use crate::domain::models::OcrPageResult;
use crate::domain::types::QualityFlag;
use crate::llm::{CompletionOpts, ImageAttachment, LlmGateway};
use crate::services::rasterizer::PageImage;

const OCR_PROVIDER_TAG: &str = "vision_llm";

const OCR_SYSTEM_PROMPT: &str = r#"You are a precise OCR engine for handwritten and printed exam scripts.
Extract ALL text from the page image, preserving line breaks and paragraph
structure. Keep the student's original spelling, grammar, and punctuation
exactly as written. Write [illegible] for any word you cannot read.

Report page quality honestly using ONLY these flags:
LOW_CONTRAST, BLURRY, PARTIAL_SCAN, UNREADABLE.

Return ONLY a JSON object:
{
  "extractedText": "<full page text, or empty string if nothing is readable>",
  "confidence": <float 0.0-1.0, your confidence in the extraction>,
  "qualityFlags": ["<flag>", ...]
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionExtraction {
    #[serde(default)]
    extracted_text: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    quality_flags: Vec<String>,
}

/// Sends one rasterised page to the vision channel and normalises the
/// extraction into an [`OcrPageResult`].
pub(crate) struct OcrProvider {
    gateway: Arc<LlmGateway>,
    low_confidence_threshold: f64,
}

impl OcrProvider {
    pub(crate) fn new(gateway: Arc<LlmGateway>, low_confidence_threshold: f64) -> Self {
        Self { gateway, low_confidence_threshold }
    }

    pub(crate) async fn extract_page(
        &self,
        upload_id: &str,
        page: &PageImage,
    ) -> Result<OcrPageResult, EngineError> {
        let timer = Instant::now();
        let payload = self
            .gateway
            .vision_complete(
                OCR_SYSTEM_PROMPT,
                "Extract all handwritten and printed text from this exam page.",
                ImageAttachment {
                    bytes: page.png_bytes.clone(),
                    mime_type: page.mime_type.to_string(),
                },
                CompletionOpts::default(),
            )
            .await?;

        let processing_ms = timer.elapsed().as_millis() as u64;
        let (text, confidence, mut flags) = match payload.parsed.as_ref() {
            Some(parsed) => normalise_extraction(parsed),
            // Some models answer the vision prompt with bare text despite the
            // JSON contract; keep the text and fall back to the heuristic.
            None => (payload.raw.trim().to_string(), None, Vec::new()),
        };

        let confidence = confidence
            .filter(|value| (0.0..=1.0).contains(value))
            .unwrap_or_else(|| heuristic_confidence(&text));

        if text.trim().is_empty() && !flags.contains(&QualityFlag::Unreadable) {
            flags.push(QualityFlag::Unreadable);
        }
        if confidence < self.low_confidence_threshold
            && !flags.contains(&QualityFlag::LowConfidence)
        {
            flags.push(QualityFlag::LowConfidence);
        }
        flags.sort();
        flags.dedup();

        metrics::histogram!(OCR_PAGE_CONFIDENCE).record(confidence);
        metrics::histogram!(OCR_PAGE_DURATION_MS).record(processing_ms as f64);

        Ok(OcrPageResult {
            upload_id: upload_id.to_string(),
            page_number: page.page_number,
            extracted_text: text,
            confidence,
            quality_flags: flags,
            provider: OCR_PROVIDER_TAG.to_string(),
            processing_ms,
        })
    }

    /// Terminal record for a page whose extraction failed outright.
    pub(crate) fn unreadable_page(upload_id: &str, page_number: u32) -> OcrPageResult {
        OcrPageResult {
            upload_id: upload_id.to_string(),
            page_number,
            extracted_text: String::new(),
            confidence: 0.0,
            quality_flags: vec![QualityFlag::Unreadable],
            provider: OCR_PROVIDER_TAG.to_string(),
            processing_ms: 0,
        }
    }
}

fn normalise_extraction(parsed: &Value) -> (String, Option<f64>, Vec<QualityFlag>) {
    let extraction: VisionExtraction = match serde_json::from_value(parsed.clone()) {
        Ok(extraction) => extraction,
        Err(_) => return (String::new(), None, Vec::new()),
    };

    let flags = extraction
        .quality_flags
        .iter()
        .filter_map(|raw| parse_quality_flag(raw))
        .collect();
    (extraction.extracted_text.trim().to_string(), extraction.confidence, flags)
}

/// Unknown flags from outside the closed vocabulary are dropped.
fn parse_quality_flag(raw: &str) -> Option<QualityFlag> {
    match raw {
        "LOW_CONTRAST" => Some(QualityFlag::LowContrast),
        "BLURRY" => Some(QualityFlag::Blurry),
        "PARTIAL_SCAN" => Some(QualityFlag::PartialScan),
        "UNREADABLE" => Some(QualityFlag::Unreadable),
        _ => None,
    }
}

/// Confidence estimate from the density of [illegible] markers, used when the
/// model omits a usable confidence value.
fn heuristic_confidence(text: &str) -> f64 {
    let word_count = text.split_whitespace().count();
    if word_count == 0 {
        return 0.0;
    }
    let illegible = text.to_lowercase().matches("[illegible]").count();
    if illegible == 0 {
        return 0.95;
    }
    (1.0 - (illegible as f64 / word_count as f64) * 2.0).max(0.0)
}
