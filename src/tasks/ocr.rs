use crate::core::metrics::OCR_SCRIPT_CONFIDENCE;
use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::types::UploadStatus;
use crate::services::ocr::OcrProvider;
use crate::services::rasterizer::single_image_page;
use crate::tasks::{self, TaskMessage};

fn fanin_key(upload_id: &str) -> String {
    format!("ocr:{upload_id}")
}

fn page_key(upload_id: &str, page_number: u32) -> String {
    format!("uploads/{upload_id}/pages/{page_number}.png")
}

/// Rasterise the uploaded document and fan out one OCR task per page. The
/// aggregate continuation fires through the fan-in barrier when the last
/// sibling completes.
pub(crate) async fn run(
    state: &EngineState,
    upload_id: &str,
    trace_id: &str,
) -> Result<(), EngineError> {
    let Some(upload) = state.store().get_upload(upload_id).await? else {
        tracing::error!(upload_id, trace_id, "upload not found for ocr");
        return Ok(());
    };

    if upload.upload_status.rank() > UploadStatus::Processing.rank() {
        tracing::info!(upload_id, trace_id, "ocr replay, pages already dispatched");
        return Ok(());
    }

    let bytes = state.storage().get(&upload.file_key).await?;

    let pages = if upload.mime_type == "application/pdf" {
        let rasterizer = state.rasterizer().clone();
        let dpi = state.settings().ocr().render_dpi;
        let rasterized = tokio::task::spawn_blocking(move || rasterizer.rasterize(&bytes, dpi))
            .await
            .map_err(|err| EngineError::Queue(format!("rasterize task failed: {err}")))?;
        match rasterized {
            Ok(pages) => pages,
            Err(err) => {
                state
                    .store()
                    .mark_upload_terminal(upload_id, UploadStatus::Failed, &err.to_string())
                    .await?;
                return Ok(());
            }
        }
    } else {
        vec![single_image_page(bytes, &upload.mime_type)]
    };

    let max_pages = state.settings().ocr().max_pages_per_script;
    if pages.len() as u32 > max_pages {
        state
            .store()
            .mark_upload_terminal(
                upload_id,
                UploadStatus::Flagged,
                &format!("PAGE_LIMIT_EXCEEDED: {} pages (limit {max_pages})", pages.len()),
            )
            .await?;
        return Ok(());
    }

    state.store().set_upload_page_count(upload_id, pages.len() as u32).await?;

    for page in &pages {
        state
            .storage()
            .put(&page_key(upload_id, page.page_number), page.png_bytes.clone(), page.mime_type)
            .await?;
    }

    state.store().fanin_init(&fanin_key(upload_id), pages.len() as u32).await?;

    tracing::info!(upload_id, trace_id, pages = pages.len(), "fanning out page ocr");
    for page in &pages {
        tasks::enqueue(state, TaskMessage::OcrPage {
            upload_id: upload_id.to_string(),
            page_number: page.page_number,
            trace_id: trace_id.to_string(),
        })
        .await?;
    }
    Ok(())
}

/// OCR one page. Failures are per-page fatal: the page is persisted empty
/// with an UNREADABLE flag and the batch carries on.
pub(crate) async fn run_page(
    state: &EngineState,
    upload_id: &str,
    page_number: u32,
    trace_id: &str,
) -> Result<(), EngineError> {
    let already_done = state.store().get_ocr_page(upload_id, page_number).await?.is_some();

    if !already_done {
        let provider = OcrProvider::new(
            state.gateway().clone(),
            state.settings().ocr().low_confidence_threshold,
        );

        let result = match state.storage().get(&page_key(upload_id, page_number)).await {
            Ok(bytes) => {
                let mut page = single_image_page(bytes, "image/png");
                page.page_number = page_number;
                match provider.extract_page(upload_id, &page).await {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(
                            upload_id,
                            page = page_number,
                            trace_id,
                            error = %err,
                            "page ocr failed, persisting unreadable page"
                        );
                        OcrProvider::unreadable_page(upload_id, page_number)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    upload_id,
                    page = page_number,
                    trace_id,
                    error = %err,
                    "page image missing, persisting unreadable page"
                );
                OcrProvider::unreadable_page(upload_id, page_number)
            }
        };

        state.store().upsert_ocr_page(result).await?;
        tracing::info!(upload_id, page = page_number, trace_id, "ocr page extracted");
    } else {
        tracing::info!(upload_id, page = page_number, trace_id, "ocr page replay, skipping");
    }

    let fired = state
        .store()
        .fanin_complete(&fanin_key(upload_id), &page_number.to_string())
        .await?;
    if fired {
        tasks::enqueue(state, TaskMessage::OcrAggregate {
            upload_id: upload_id.to_string(),
            trace_id: trace_id.to_string(),
        })
        .await?;
    }
    Ok(())
}

/// Chord continuation: all pages are terminal; roll the upload forward and
/// hand off to segmentation.
pub(crate) async fn run_aggregate(
    state: &EngineState,
    upload_id: &str,
    trace_id: &str,
) -> Result<(), EngineError> {
    let pages = state.store().list_ocr_pages(upload_id).await?;
    if pages.is_empty() {
        state
            .store()
            .mark_upload_terminal(upload_id, UploadStatus::Failed, "no OCR pages produced")
            .await?;
        return Ok(());
    }

    let advanced =
        state.store().advance_upload_status(upload_id, UploadStatus::OcrComplete).await?;
    if !advanced {
        tracing::info!(upload_id, trace_id, "ocr aggregate replay");
        return Ok(());
    }

    let avg_confidence =
        pages.iter().map(|page| page.confidence).sum::<f64>() / pages.len() as f64;
    metrics::histogram!(OCR_SCRIPT_CONFIDENCE).record(avg_confidence);
    tracing::info!(
        upload_id,
        trace_id,
        pages = pages.len(),
        avg_confidence,
        "ocr aggregation complete"
    );

    tasks::enqueue(state, TaskMessage::Segment {
        upload_id: upload_id.to_string(),
        forced: false,
        attempt: 0,
        trace_id: trace_id.to_string(),
    })
    .await
}
