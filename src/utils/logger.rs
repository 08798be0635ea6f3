use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output shape of the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact lines for a terminal.
    Compact,
    /// JSON lines for schedulers that collect logs.
    Json,
}

impl LogFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "flow_etl=debug,info"
    } else {
        "flow_etl=info"
    }
}

/// Installs the global subscriber. A second call leaves the first one in place.
pub fn init_logger(format: LogFormat, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .try_init(),
        // Span fields carry the run name and audit key on every line.
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logger already installed");
    }
}

/// Span wrapping one writer run.
pub fn run_span(run_name: &str, audit_key: i64) -> Span {
    tracing::info_span!("run", name = %run_name, audit_key)
}
