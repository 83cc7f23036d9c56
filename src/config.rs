use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_run_times() -> Vec<String> {
    vec!["13:45".into(), "20:15".into()]
}

fn default_rsi_period() -> usize {
    14
}

fn default_ema_short_period() -> usize {
    50
}

fn default_ema_long_period() -> usize {
    200
}

fn default_lookback_bars() -> usize {
    300
}

fn default_price_move_threshold() -> f64 {
    0.05
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_cooldown_minutes() -> u64 {
    240
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_llm_concurrency() -> usize {
    2
}

fn default_run_timeout_secs() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_market_base_url() -> String {
    "https://query1.finance.yahoo.com/v8/finance/chart".into()
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_sec_base_url() -> String {
    "https://data.sec.gov".into()
}

fn default_sec_tickers_url() -> String {
    "https://www.sec.gov/files/company_tickers.json".into()
}

fn default_sec_user_agent() -> String {
    "market-oracle ops@example.com".into()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    600
}

fn default_temperature() -> f32 {
    0.3
}

fn default_context_bars() -> usize {
    20
}

fn default_max_prompt_chars() -> usize {
    6_000
}

fn default_channel() -> String {
    "telegram".into()
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".into()
}

fn default_telegram_base_url() -> String {
    "https://api.telegram.org".into()
}

fn default_max_message_len() -> usize {
    4_000
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Wall-clock run times in UTC, `"HH:MM"`.
    #[serde(default = "default_run_times")]
    pub run_times: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            run_times: default_run_times(),
        }
    }
}

impl ScheduleConfig {
    /// Parsed, sorted and deduplicated run times. Malformed entries are
    /// rejected by validation, so they are simply skipped here.
    pub fn parsed_run_times(&self) -> Vec<NaiveTime> {
        let mut times: Vec<NaiveTime> =
            self.run_times.iter().filter_map(|t| parse_run_time(t)).collect();
        times.sort();
        times.dedup();
        times
    }
}

pub fn parse_run_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

#[derive(Debug, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_ema_short_period")]
    pub ema_short_period: usize,
    #[serde(default = "default_ema_long_period")]
    pub ema_long_period: usize,
    /// Daily bars requested per ticker.
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            ema_short_period: default_ema_short_period(),
            ema_long_period: default_ema_long_period(),
            lookback_bars: default_lookback_bars(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GateConfig {
    /// Fractional move against the last notified price, e.g. `0.05` for 5%.
    #[serde(default = "default_price_move_threshold")]
    pub price_move_threshold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            price_move_threshold: default_price_move_threshold(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Global cap on simultaneous language model calls.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub fetch_retry: RetryConfig,
    #[serde(default)]
    pub llm_retry: RetryConfig,
    #[serde(default)]
    pub dispatch_retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            llm_concurrency: default_llm_concurrency(),
            run_timeout_secs: default_run_timeout_secs(),
            fetch_retry: RetryConfig::default(),
            llm_retry: RetryConfig::default(),
            dispatch_retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_market_base_url")]
    pub base_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Enrich analysis prompts with SEC filing KPIs.
    #[serde(default)]
    pub fundamentals: bool,
    #[serde(default = "default_sec_base_url")]
    pub sec_base_url: String,
    #[serde(default = "default_sec_tickers_url")]
    pub sec_tickers_url: String,
    /// SEC requires a descriptive User-Agent with a contact address.
    #[serde(default = "default_sec_user_agent")]
    pub sec_user_agent: String,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: default_market_base_url(),
            requests_per_second: default_requests_per_second(),
            timeout_secs: default_http_timeout_secs(),
            fundamentals: false,
            sec_base_url: default_sec_base_url(),
            sec_tickers_url: default_sec_tickers_url(),
            sec_user_agent: default_sec_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Most recent bars included in the prompt.
    #[serde(default = "default_context_bars")]
    pub context_bars: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_bars: default_context_bars(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NotifierConfig {
    /// Accepted values: `"telegram"` | `"terminal"`
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_telegram_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            bot_token_env: default_bot_token_env(),
            base_url: default_telegram_base_url(),
            timeout_secs: default_http_timeout_secs(),
            max_message_len: default_max_message_len(),
        }
    }
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

/// Read a secret from the environment variable named in the config.
pub fn secret_from_env(name: &str) -> Result<String, Report<ConfigError>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Report::new(ConfigError::MissingEnv { name: name.into() })),
    }
}

const VALID_LOG_FORMATS: &[&str] = &["text", "json"];
const VALID_CHANNELS: &[&str] = &["telegram", "terminal"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(config)?;
    validate_run_times(config)?;
    validate_indicators(config)?;
    validate_gate(config)?;
    validate_pipeline(config)?;
    validate_llm(config)?;
    validate_notifier(config)?;
    Ok(())
}

fn invalid(field: impl Into<String>) -> Report<ConfigError> {
    Report::new(ConfigError::Validation {
        field: field.into(),
    })
}

fn validate_general(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !VALID_LOG_FORMATS.contains(&config.general.log_format.as_str()) {
        return Err(invalid(format!(
            "general.log_format \"{}\" is not valid",
            config.general.log_format
        )));
    }
    Ok(())
}

fn validate_run_times(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for time in &config.schedule.run_times {
        if parse_run_time(time).is_none() {
            return Err(invalid(format!(
                "schedule.run_times: \"{time}\" is not HH:MM"
            )));
        }
    }
    Ok(())
}

fn validate_indicators(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let ind = &config.indicators;
    if ind.rsi_period == 0 || ind.ema_short_period == 0 || ind.ema_long_period == 0 {
        return Err(invalid("indicators: periods must be > 0"));
    }
    if ind.ema_short_period >= ind.ema_long_period {
        return Err(invalid(
            "indicators.ema_short_period must be shorter than ema_long_period",
        ));
    }
    if ind.lookback_bars < ind.ema_long_period {
        return Err(invalid(format!(
            "indicators.lookback_bars ({}) cannot cover ema_long_period ({})",
            ind.lookback_bars, ind.ema_long_period
        )));
    }
    Ok(())
}

fn validate_gate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let gate = &config.gate;
    if !(gate.price_move_threshold > 0.0) {
        return Err(invalid("gate.price_move_threshold must be > 0"));
    }
    if !(0.0 < gate.rsi_oversold && gate.rsi_oversold < gate.rsi_overbought)
        || gate.rsi_overbought >= 100.0
    {
        return Err(invalid(
            "gate: require 0 < rsi_oversold < rsi_overbought < 100",
        ));
    }
    Ok(())
}

fn validate_pipeline(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let p = &config.pipeline;
    if p.worker_concurrency == 0 || p.llm_concurrency == 0 {
        return Err(invalid("pipeline: concurrency limits must be > 0"));
    }
    if p.run_timeout_secs == 0 {
        return Err(invalid("pipeline.run_timeout_secs must be > 0"));
    }
    for (name, retry) in [
        ("fetch_retry", &p.fetch_retry),
        ("llm_retry", &p.llm_retry),
        ("dispatch_retry", &p.dispatch_retry),
    ] {
        if retry.max_attempts == 0 {
            return Err(invalid(format!("pipeline.{name}.max_attempts must be > 0")));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(invalid(format!(
                "pipeline.{name}.initial_backoff_ms exceeds max_backoff_ms"
            )));
        }
    }
    if config.market_data.requests_per_second == 0 {
        return Err(invalid("market_data.requests_per_second must be > 0"));
    }
    Ok(())
}

fn validate_llm(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.llm.context_bars == 0 {
        return Err(invalid("llm.context_bars must be > 0"));
    }
    if config.llm.max_prompt_chars < 500 {
        return Err(invalid("llm.max_prompt_chars must be at least 500"));
    }
    Ok(())
}

fn validate_notifier(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !VALID_CHANNELS.contains(&config.notifier.channel.as_str()) {
        return Err(invalid(format!(
            "notifier.channel \"{}\" is not valid",
            config.notifier.channel
        )));
    }
    if config.notifier.max_message_len < 100 {
        return Err(invalid("notifier.max_message_len must be at least 100"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AppConfig {
        toml::from_str(toml).expect("parse failed")
    }

    #[test]
    fn valid_full_config_parses() {
        let toml = r#"
[general]
log_level = "debug"
log_format = "json"
data_dir = "/tmp/oracle"

[schedule]
run_times = ["09:00", "21:00"]

[indicators]
rsi_period = 14
ema_short_period = 50
ema_long_period = 200
lookback_bars = 260

[gate]
price_move_threshold = 0.03
cooldown_minutes = 60

[pipeline]
worker_concurrency = 4
llm_concurrency = 1
run_timeout_secs = 300
llm_retry = { max_attempts = 2, initial_backoff_ms = 100, max_backoff_ms = 1000 }

[market_data]
fundamentals = true

[llm]
model = "gpt-4o"
context_bars = 30

[notifier]
channel = "terminal"
"#;
        let config = parse(toml);
        validate(&config).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.schedule.parsed_run_times().len(), 2);
        assert_eq!(config.gate.cooldown_minutes, 60);
        assert_eq!(config.pipeline.llm_retry.max_attempts, 2);
        assert_eq!(config.pipeline.fetch_retry.max_attempts, 3);
        assert!(config.market_data.fundamentals);
        assert_eq!(config.notifier.channel, "terminal");
    }

    #[test]
    fn defaults_applied_when_sections_omitted() {
        let config = parse("");
        validate(&config).unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "text");
        assert_eq!(config.indicators.rsi_period, 14);
        assert_eq!(config.indicators.ema_long_period, 200);
        assert!((config.gate.price_move_threshold - 0.05).abs() < 1e-12);
        assert_eq!(config.gate.rsi_overbought, 70.0);
        assert_eq!(config.gate.rsi_oversold, 30.0);
        assert_eq!(config.pipeline.worker_concurrency, 8);
        assert!(!config.market_data.fundamentals);
        assert_eq!(config.notifier.channel, "telegram");
    }

    #[test]
    fn malformed_run_time_rejected() {
        let config = parse("[schedule]\nrun_times = [\"25:00\"]\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn inverted_rsi_thresholds_rejected() {
        let config = parse("[gate]\nrsi_overbought = 30.0\nrsi_oversold = 70.0\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn lookback_must_cover_long_ema() {
        let config = parse("[indicators]\nlookback_bars = 100\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_retry_attempts_rejected() {
        let config = parse("[pipeline]\ndispatch_retry = { max_attempts = 0 }\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_channel_rejected() {
        let config = parse("[notifier]\nchannel = \"carrier-pigeon\"\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn run_times_sorted_and_deduplicated() {
        let config = parse("[schedule]\nrun_times = [\"21:00\", \"09:30\", \"21:00\"]\n");
        let times = config.schedule.parsed_run_times();
        assert_eq!(
            times,
            vec![
                NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(21, 0, 0).unwrap()
            ]
        );
    }
}
