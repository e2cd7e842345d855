use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;

/// Crates whose debug chatter would drown the pipeline's own events. The
/// engine logs every stage transition with upload_id / script_id / run_id /
/// page fields, so transport internals stay at warn unless RUST_LOG says
/// otherwise.
const QUIETED_DEPS: &[&str] = &["hyper", "reqwest", "redis", "h2", "rustls"];

pub fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let mut directives = vec![settings.telemetry().log_level.clone()];
            directives.extend(QUIETED_DEPS.iter().map(|dep| format!("{dep}=warn")));
            EnvFilter::new(directives.join(","))
        }
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    let result = if settings.telemetry().json {
        // JSON output for log aggregation; one object per event, field keys
        // matching the persisted entity attributes.
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|err| anyhow::anyhow!(err.to_string()))
}
