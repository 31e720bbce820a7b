//! Tracing subscriber setup for binaries and tests embedding the store.

use tracing_subscriber::EnvFilter;

/// Output format for [`init_tracing_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// `TASKLANE_LOG_FORMAT=json` selects JSON, anything else pretty output
    pub fn from_env() -> Self {
        match std::env::var("TASKLANE_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install a global subscriber filtered by `RUST_LOG` (default `info`), in
/// the format chosen by `TASKLANE_LOG_FORMAT`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing() -> bool {
    init_tracing_with(LogFormat::from_env())
}

/// Install a global subscriber with an explicit format
pub fn init_tracing_with(format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported() {
        init_tracing_with(LogFormat::Json);
        assert!(!init_tracing_with(LogFormat::Pretty));
    }
}
