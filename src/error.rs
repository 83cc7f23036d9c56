use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
    #[display("missing environment variable {name}")]
    MissingEnv { name: String },
}

#[derive(Debug, Display, Error)]
pub enum MarketDataError {
    #[display("request to {provider} failed")]
    Request { provider: String },
    #[display("failed to parse response from {provider}")]
    ResponseParse { provider: String },
    #[display("{provider} returned no data for {ticker}")]
    NoData { provider: String, ticker: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("stored row is corrupt: {reason}")]
    Corrupt { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

#[derive(Debug, Display, Error)]
pub enum AnalysisError {
    #[display("language model call timed out")]
    Timeout,
    #[display("language model provider error (status {status})")]
    Provider { status: u16 },
    #[display("language model unreachable")]
    Transport,
    #[display("malformed language model response: {reason}")]
    Parse { reason: String },
}

impl AnalysisError {
    /// Timeouts, throttling and server-side failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport => true,
            Self::Provider { status } => *status == 429 || *status >= 500,
            Self::Parse { .. } => false,
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("delivery through {channel} failed")]
    Delivery { channel: String },
}

#[derive(Debug, Display, Error)]
pub enum PipelineError {
    #[display("failed to enumerate subscriber portfolios")]
    Enumerate,
    #[display("market data source unavailable for all {pairs} pairs")]
    DataSourceUnavailable { pairs: usize },
    #[display("persistence store unavailable for all {pairs} pairs")]
    StoreUnavailable { pairs: usize },
}
