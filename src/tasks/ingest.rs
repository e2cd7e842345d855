use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::types::UploadStatus;
use crate::tasks::{self, TaskMessage};

/// Stage-1 entry: move the upload into PROCESSING and hand it to the OCR
/// stage. A replay that finds the transition already taken enqueues nothing.
pub(crate) async fn run(
    state: &EngineState,
    upload_id: &str,
    trace_id: &str,
) -> Result<(), EngineError> {
    let Some(upload) = state.store().get_upload(upload_id).await? else {
        tracing::error!(upload_id, trace_id, "upload not found for ingest");
        return Ok(());
    };

    if !state
        .settings()
        .upload()
        .allowed_mime_types
        .iter()
        .any(|mime| mime == &upload.mime_type)
    {
        state
            .store()
            .mark_upload_terminal(
                upload_id,
                UploadStatus::Failed,
                &format!("UNSUPPORTED_MIME: {}", upload.mime_type),
            )
            .await?;
        return Ok(());
    }

    let advanced =
        state.store().advance_upload_status(upload_id, UploadStatus::Processing).await?;
    if !advanced {
        tracing::info!(upload_id, trace_id, "ingest replay, upload already processing");
        return Ok(());
    }

    tracing::info!(upload_id, trace_id, "upload ingested");
    tasks::enqueue(state, TaskMessage::Ocr {
        upload_id: upload_id.to_string(),
        trace_id: trace_id.to_string(),
    })
    .await
}
