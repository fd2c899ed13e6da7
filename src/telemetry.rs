use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> anyhow::Result<opentelemetry::sdk::trace::Tracer> {
    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")?;
    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)?
        .connect()
        .await?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                crate::OPERATOR_NAME,
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)?;
    Ok(tracer)
}

/// Filter directive for a `LOG_LEVEL` value, unknown values meaning `info`
pub fn level_directive(level: Option<&str>) -> &'static str {
    match level.map(str::to_lowercase).as_deref() {
        Some("debug") => "debug",
        Some("warn") => "warn",
        Some("error" | "panic" | "fatal") => "error",
        _ => "info",
    }
}

/// Initialize tracing
///
/// `RUST_LOG` takes precedence over `LOG_LEVEL`; `LOG_FORMAT=json` switches
/// to JSON lines.
pub async fn init() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL").ok();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(level.as_deref())))?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let logger = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };

    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await?);

    let collector = Registry::default().with(logger).with(filter);
    #[cfg(feature = "telemetry")]
    let collector = collector.with(telemetry);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(level_directive(None), "info");
        assert_eq!(level_directive(Some("DEBUG")), "debug");
        assert_eq!(level_directive(Some("warn")), "warn");
        assert_eq!(level_directive(Some("panic")), "error");
        assert_eq!(level_directive(Some("Fatal")), "error");
        assert_eq!(level_directive(Some("verbose")), "info");
    }

    #[test]
    #[cfg(not(feature = "telemetry"))]
    fn trace_id_without_exporter_is_invalid() {
        assert_eq!(get_trace_id(), TraceId::INVALID);
    }
}
