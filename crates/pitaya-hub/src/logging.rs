//! Tracing initialization for the pitaya binaries.
//!
//! Output goes to stderr: the worker process uses stdout for its protocol,
//! and the CLI keeps stdout for command results. `RUST_LOG` overrides the
//! configured filter.
//!
//! Calling [`init_tracing`] more than once is harmless; later calls keep the
//! subscriber that is already installed.

use pitaya_core::config::LoggingSettings;
use pitaya_core::{PitayaError, PitayaResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber described by `settings`.
pub fn init_tracing(settings: &LoggingSettings) -> PitayaResult<()> {
    let filter = build_filter(&settings.filter)?;

    let layer = if settings.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("already been set") {
                Ok(())
            } else {
                Err(PitayaError::Configuration(format!(
                    "failed to initialize tracing: {e}"
                )))
            }
        })
}

fn build_filter(default: &str) -> PitayaResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default).map_err(|e| {
            PitayaError::Configuration(format!("invalid log filter '{default}': {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        let settings = LoggingSettings {
            filter: "pitaya_hub=debug".into(),
            json: false,
        };
        init_tracing(&settings).unwrap();
        init_tracing(&settings).unwrap();
    }

    #[test]
    fn test_filter_directives() {
        assert!(build_filter("info,pitaya_hub=trace").is_ok());
    }
}
