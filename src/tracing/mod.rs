//! Tracing and logging.
//!
//! Logging to stderr is always enabled, at least at the "ERROR"
//! level. The level can be given explicitly, otherwise
//! `BULKSYNC_LOG` is read as a `tracing-subscriber` env filter, eg:
//!
//! ```text
//! BULKSYNC_LOG="bulksync=debug,error" bulksync sum ...
//! ```
//!
//! Exporting spans to an OpenTelemetry collector is optional and
//! needs an [`OtlpTracingConfig`].

use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::errors::{BspError, BspResult, Reraise};

pub mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Env var read for the log filter when no level is given.
pub const LOG_ENV_VAR: &str = "BULKSYNC_LOG";

/// Each tracing backend returns the proper `Tracer` for itself.
trait TracerBuilder {
    fn build(&self) -> BspResult<Tracer>;
}

pub(crate) fn parse_log_level(level: &str) -> BspResult<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        level => Err(BspError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_layer<S>(log_level: Option<&str>) -> BspResult<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + 'static,
{
    let fmt = tracing_subscriber::fmt::Layer::default()
        .compact()
        .with_writer(std::io::stderr)
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Peers are threads, their names say which one logged
        .with_thread_names(true);

    let layer = match (log_level, std::env::var(LOG_ENV_VAR)) {
        (Some(level), _) => fmt
            .with_filter(Targets::new().with_target("bulksync", parse_log_level(level)?))
            .boxed(),
        (None, Ok(directives)) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                BspError::Config(format!("bad {LOG_ENV_VAR}={directives:?}: {err}"))
            })?;
            fmt.with_filter(filter).boxed()
        }
        (None, Err(_)) => fmt
            .with_filter(Targets::new().with_target("bulksync", LevelFilter::ERROR))
            .boxed(),
    };
    Ok(layer)
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct
/// itself, span exporters run on it.
pub struct BulksyncTracer {
    rt: tokio::runtime::Runtime,
}

impl BulksyncTracer {
    pub fn new() -> BspResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bulksync-telemetry")
            .enable_all()
            .build()
            .reraise("error initializing tokio runtime for tracing")?;
        Ok(Self { rt })
    }

    /// Configure logging and, if `otlp` is given, span export.
    ///
    /// Returns a guard that you have to keep in scope for the whole
    /// execution of the code you want to trace.
    pub fn setup(
        &self,
        otlp: Option<OtlpTracingConfig>,
        log_level: Option<&str>,
    ) -> BspResult<EnterGuard<'_>> {
        let guard = self.rt.enter();
        let logs = log_layer(log_level)?;

        // The batch exporter spawns onto the runtime, so build it from
        // inside.
        let initializer = async move {
            if let Some(conf) = otlp {
                let tracer = conf.build()?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    // Send all traces from bulksync
                    .with_filter(Targets::new().with_target("bulksync", LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            } else {
                set_global_subscriber(Registry::default().with(logs));
            }
            BspResult::Ok(())
        };
        self.rt.block_on(initializer)?;
        Ok(guard)
    }
}

impl Drop for BulksyncTracer {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

// Try to set the global default subscriber, logging the error
// without failing if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens in
    // tests and if a process runs more than one task.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}
