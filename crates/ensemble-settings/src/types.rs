//! Settings sections. Every struct is `#[serde(default)]` so a partial
//! settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnsembleSettings {
    pub orchestrator: OrchestratorSettings,
    pub dispatcher: DispatcherSettings,
    pub bus: BusSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Round loop limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Rounds allowed before the task fails with max-rounds-exceeded.
    pub max_rounds: u32,
    /// Tool call / re-generate cycles allowed within one round.
    pub max_tool_iterations_per_round: u32,
    /// Extra attempts for a retryable generation failure.
    pub generation_retries: u32,
    pub generation_retry_delay_ms: u64,
    /// Chunks buffered for the caller before the producer waits.
    pub stream_buffer: usize,
    /// Wall-clock bound on a whole task run.
    pub max_run_duration_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_tool_iterations_per_round: 5,
            generation_retries: 2,
            generation_retry_delay_ms: 200,
            stream_buffer: 64,
            max_run_duration_ms: 3_600_000,
        }
    }
}

/// Tool execution limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherSettings {
    /// Tool calls in flight at once, shared by every round using the dispatcher.
    pub max_concurrency: usize,
    pub tool_timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout_ms: 120_000,
            max_output_bytes: 256 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// How long `stop()` waits for in-flight async handlers.
    pub drain_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Task database path. Relative paths resolve against `~/.ensemble`.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "tasks.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = EnsembleSettings::default();
        assert_eq!(s.orchestrator.max_rounds, 10);
        assert_eq!(s.orchestrator.max_tool_iterations_per_round, 5);
        assert_eq!(s.dispatcher.max_concurrency, 4);
        assert_eq!(s.dispatcher.tool_timeout_ms, 120_000);
        assert_eq!(s.bus.drain_timeout_ms, 5_000);
        assert_eq!(s.store.db_path, "tasks.db");
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: EnsembleSettings =
            serde_json::from_value(serde_json::json!({"orchestrator": {"maxRounds": 3}})).unwrap();
        assert_eq!(s.orchestrator.max_rounds, 3);
        assert_eq!(s.orchestrator.stream_buffer, 64);
        assert_eq!(s.dispatcher.max_output_bytes, 256 * 1024);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(EnsembleSettings::default()).unwrap();
        assert_eq!(json["dispatcher"]["toolTimeoutMs"], 120_000);
        assert_eq!(json["store"]["dbPath"], "tasks.db");
    }
}
