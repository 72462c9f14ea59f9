use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "ensemble_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a textual level, falling back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: parse_level(level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }
}

/// Returned by [`init_telemetry`].
#[derive(Debug)]
pub struct TelemetryGuard {
    installed: bool,
    directives: String,
}

impl TelemetryGuard {
    /// False when a global subscriber already existed and this call was a no-op.
    pub fn installed(&self) -> bool {
        self.installed
    }

    /// Filter directives used when RUST_LOG is unset.
    pub fn directives(&self) -> &str {
        &self.directives
    }
}

/// Initialize the global tracing subscriber. Safe to call more than once.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(&config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let pretty_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        installed,
        directives,
    }
}

/// `info,ensemble_engine=debug` style directive string.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("ensemble_engine".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(filter_directives(&config), "warn,ensemble_engine=debug");
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
        assert_eq!(TelemetryConfig::from_level_str("loud", false).log_level, Level::INFO);
    }

    #[test]
    fn second_init_is_a_noop() {
        let _first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        assert!(!second.installed());
        assert_eq!(second.directives(), "info");
    }
}
