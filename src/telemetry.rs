//! Logging and optional OTLP export.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! `RELAY_LOG` (falling back to `RUST_LOG`) sets the filter; the default is
//! `warn`. `RELAY_LOG_FORMAT=json` switches to one JSON object per line.
//!
//! With the `otel` feature, spans and log events are also exported over
//! OTLP/HTTP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const SERVICE_NAME: &str = "relay";

/// Flushes exporters when dropped. Hold it for the life of `main`.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    otel: Option<otel::Providers>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.otel.take() {
            providers.shutdown();
        }
    }
}

fn env_filter() -> EnvFilter {
    ["RELAY_LOG", "RUST_LOG"]
        .iter()
        .find_map(|var| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .and_then(|v| EnvFilter::try_new(v).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn json_requested() -> bool {
    std::env::var("RELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Safe to call once per process; a second
/// call leaves the first subscriber in place.
pub fn init() -> TelemetryGuard {
    let json = json_requested();
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    #[cfg(feature = "otel")]
    {
        let providers = otel::Providers::from_env();
        let (trace_layer, log_layer) = match &providers {
            Some(p) => (Some(p.trace_layer()), Some(p.log_layer())),
            None => (None, None),
        };
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(json_layer)
            .with(text_layer)
            .with(trace_layer)
            .with(log_layer)
            .try_init()
            .is_ok();
        TelemetryGuard {
            otel: providers.filter(|_| installed),
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(json_layer)
            .with(text_layer)
            .try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_otlp::{LogExporter, SpanExporter};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
    use tracing_opentelemetry::OpenTelemetryLayer;

    pub struct Providers {
        tracer: SdkTracerProvider,
        logger: SdkLoggerProvider,
    }

    impl Providers {
        /// Build exporters when an OTLP endpoint is configured. Export
        /// problems are reported on stderr and never stop the command.
        pub fn from_env() -> Option<Self> {
            let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
            if endpoint.trim().is_empty() {
                return None;
            }
            let resource = Resource::builder().with_service_name(super::SERVICE_NAME).build();

            let spans = match SpanExporter::builder().with_http().build() {
                Ok(e) => e,
                Err(e) => {
                    eprintln!("warning: OTLP span exporter disabled: {e}");
                    return None;
                }
            };
            let logs = match LogExporter::builder().with_http().build() {
                Ok(e) => e,
                Err(e) => {
                    eprintln!("warning: OTLP log exporter disabled: {e}");
                    return None;
                }
            };

            let tracer = SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build();
            let logger = SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build();
            Some(Self { tracer, logger })
        }

        pub fn trace_layer<S>(&self) -> OpenTelemetryLayer<S, SdkTracer>
        where
            S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
        {
            tracing_opentelemetry::layer().with_tracer(self.tracer.tracer(super::SERVICE_NAME))
        }

        pub fn log_layer(
            &self,
        ) -> OpenTelemetryTracingBridge<SdkLoggerProvider, opentelemetry_sdk::logs::SdkLogger> {
            OpenTelemetryTracingBridge::new(&self.logger)
        }

        pub fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                eprintln!("warning: flushing spans failed: {e}");
            }
            if let Err(e) = self.logger.shutdown() {
                eprintln!("warning: flushing logs failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_filter_defaults_to_warn() {
        // Only meaningful when neither variable is set in the test env.
        if std::env::var("RELAY_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            assert_eq!(env_filter().to_string(), "warn");
        }
    }
}
