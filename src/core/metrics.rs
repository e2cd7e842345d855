use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

/// Metric names used across the engine. Kept here so the recorder can
/// register descriptions for everything the tasks and agents emit.
pub const TASKS_TOTAL: &str = "tasks_total";
pub const TASKS_ENQUEUED_TOTAL: &str = "tasks_enqueued_total";
pub const AGENT_CALLS_TOTAL: &str = "agent_calls_total";
pub const AGENT_LATENCY_MS: &str = "agent_latency_ms";
pub const EVALUATIONS_TOTAL: &str = "evaluations_total";
pub const OCR_PAGE_CONFIDENCE: &str = "ocr_page_confidence";
pub const OCR_PAGE_DURATION_MS: &str = "ocr_page_duration_ms";
pub const OCR_SCRIPT_CONFIDENCE: &str = "ocr_script_confidence";
pub const UPLOADS_TOTAL: &str = "uploads_total";
pub const OVERRIDES_TOTAL: &str = "overrides_total";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(TASKS_TOTAL, "Task-graph executions by task name and outcome");
    metrics::describe_counter!(TASKS_ENQUEUED_TOTAL, "Tasks placed on a queue, by task name");
    metrics::describe_counter!(
        AGENT_CALLS_TOTAL,
        "Evaluation agent invocations by agent and outcome"
    );
    metrics::describe_histogram!(AGENT_LATENCY_MS, "Wall-clock latency of one agent call");
    metrics::describe_counter!(EVALUATIONS_TOTAL, "Per-question evaluation outcomes");
    metrics::describe_histogram!(OCR_PAGE_CONFIDENCE, "Extraction confidence per page");
    metrics::describe_histogram!(OCR_PAGE_DURATION_MS, "Vision extraction time per page");
    metrics::describe_histogram!(
        OCR_SCRIPT_CONFIDENCE,
        "Average OCR confidence across a script's pages"
    );
    metrics::describe_counter!(UPLOADS_TOTAL, "Uploads accepted for processing");
    metrics::describe_counter!(OVERRIDES_TOTAL, "Reviewer overrides applied");
}

pub fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
