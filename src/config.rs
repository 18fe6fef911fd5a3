//! Runtime configuration for the orchestration core.
//!
//! [`OrchestratorConfig`] is constructed once at process start from environment
//! variables and passed by reference (or `Arc`) to every component that needs
//! it. No file-format config parsing is introduced — consistent with the rest
//! of this crate, which prefers a handful of `std::env::var` reads over a
//! configuration-file dependency.
//!
//! # Example
//!
//! ```rust
//! use roundtable_core::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::default();
//! assert_eq!(config.max_leverage, 20);
//! assert_eq!(config.symbol, "BTC-USDT-SWAP");
//! ```

/// Global configuration for the deliberation/trading core.
///
/// Construct via [`OrchestratorConfig::from_env`] in production, or
/// [`OrchestratorConfig::default`] in tests so behavior never depends on the
/// ambient environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hours between scheduled trading cycles. `SCHEDULER_INTERVAL_HOURS`, default 4.0.
    pub scheduler_interval_hours: f64,
    /// Maximum leverage an opened position may use. `MAX_LEVERAGE`, default 20.
    pub max_leverage: u32,
    /// Maximum fraction of available balance a single position may use. `MAX_POSITION_PERCENT`, default 0.30.
    pub max_position_percent: f64,
    /// Minimum vote confidence (0-100) required to act on a signal. `MIN_CONFIDENCE`, default 60.
    pub min_confidence: u8,
    /// Base URL of the LLM gateway. `LLM_GATEWAY_URL`.
    pub llm_gateway_url: String,
    /// Base URL of the web-search tool service. `WEB_SEARCH_URL`.
    pub web_search_url: String,
    /// Base URL of the financial-data tool service. `FINANCIAL_DATA_URL`.
    pub financial_data_url: String,
    /// Trading symbol this instance trades. `SYMBOL`, default `BTC-USDT-SWAP`.
    pub symbol: String,

    /// Bounded timeout for a single tool invocation (C1). Default 30s.
    pub tool_call_timeout_secs: u64,
    /// Bounded timeout for a single LLM request/response (C2). Default 120s.
    pub llm_call_timeout_secs: u64,
    /// Starting backoff delay for LLM 503 retries (C2). Default 2s, doubling, 3 attempts.
    pub llm_retry_initial_backoff_secs: u64,
    /// Maximum retry attempts on LLM 503 (C2). Default 3.
    pub llm_retry_max_attempts: u32,
    /// Hard cap on rounds per roundtable meeting (C6). Default 8.
    pub max_rounds_per_meeting: usize,
    /// Cap on message-bus history before oldest non-summary messages are elided (C3). Default 1000.
    pub max_message_history: usize,
    /// Max concurrent parallel agent turns (DD's TDD/MDD fan-out). Default 4.
    pub max_concurrent_agent_turns: usize,
    /// Max concurrent sessions per process. Default 100.
    pub max_concurrent_sessions: usize,
    /// Hard timeout for one scheduler cycle (C8). Default 25 minutes.
    pub scheduler_cycle_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_hours: 4.0,
            max_leverage: 20,
            max_position_percent: 0.30,
            min_confidence: 60,
            llm_gateway_url: "http://localhost:8090".to_string(),
            web_search_url: "http://localhost:8091".to_string(),
            financial_data_url: "http://localhost:8092".to_string(),
            symbol: "BTC-USDT-SWAP".to_string(),
            tool_call_timeout_secs: 30,
            llm_call_timeout_secs: 120,
            llm_retry_initial_backoff_secs: 2,
            llm_retry_max_attempts: 3,
            max_rounds_per_meeting: 8,
            max_message_history: 1000,
            max_concurrent_agent_turns: 4,
            max_concurrent_sessions: 100,
            scheduler_cycle_timeout_secs: 25 * 60,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from environment variables, falling back to documented
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scheduler_interval_hours: env_parse(
                "SCHEDULER_INTERVAL_HOURS",
                defaults.scheduler_interval_hours,
            ),
            max_leverage: env_parse("MAX_LEVERAGE", defaults.max_leverage),
            max_position_percent: env_parse(
                "MAX_POSITION_PERCENT",
                defaults.max_position_percent,
            ),
            min_confidence: env_parse("MIN_CONFIDENCE", defaults.min_confidence),
            llm_gateway_url: std::env::var("LLM_GATEWAY_URL")
                .unwrap_or(defaults.llm_gateway_url),
            web_search_url: std::env::var("WEB_SEARCH_URL").unwrap_or(defaults.web_search_url),
            financial_data_url: std::env::var("FINANCIAL_DATA_URL")
                .unwrap_or(defaults.financial_data_url),
            symbol: std::env::var("SYMBOL").unwrap_or(defaults.symbol),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.scheduler_interval_hours, 4.0);
        assert_eq!(config.max_leverage, 20);
        assert_eq!(config.max_position_percent, 0.30);
        assert_eq!(config.min_confidence, 60);
        assert_eq!(config.symbol, "BTC-USDT-SWAP");
        assert_eq!(config.max_rounds_per_meeting, 8);
        assert_eq!(config.max_message_history, 1000);
    }

    #[test]
    fn env_parse_falls_back_on_missing_or_bad_value() {
        std::env::remove_var("ROUNDTABLE_CORE_TEST_KEY_1");
        let v: u32 = env_parse("ROUNDTABLE_CORE_TEST_KEY_1", 7);
        assert_eq!(v, 7);
    }
}
