use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LogFormat;

/// Initialize structured logging. `RUST_LOG` overrides the configured level.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => {
            Registry::default()
                .with(env_filter)
                .with(fmt_layer.json().with_current_span(false).with_span_list(true))
                .init();
        }
        LogFormat::Console => {
            Registry::default()
                .with(env_filter)
                .with(fmt_layer.pretty().with_ansi(true))
                .init();
        }
    }

    tracing::info!(%level, ?format, "logging initialized");
    Ok(())
}

/// Create a request-scoped tracing span.
pub fn create_request_span(protocol: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        protocol = protocol,
        http.method = method,
        http.path = path,
        task.id = tracing::field::Empty,
    )
}
