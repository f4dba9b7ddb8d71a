use thiserror::Error;

/// A transaction that cannot be scored. The caller gets this instead of a
/// default score.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("transaction {id}: amount {amount} is negative or not a number")]
    InvalidAmount { id: String, amount: f64 },

    #[error("transaction {id}: tax amount {tax} is negative or not a number")]
    InvalidTax { id: String, tax: f64 },

    #[error("transaction {id}: timestamp {raw:?} is missing or unparseable")]
    InvalidTimestamp { id: String, raw: String },

    #[error("transaction {id}: {field} is empty")]
    MissingField { id: String, field: &'static str },

    #[error("transaction {id}: unknown {field} {value:?}")]
    UnknownVariant {
        id: String,
        field: &'static str,
        value: String,
    },
}

/// Invalid configuration. Fatal at startup and on reconfigure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("factor weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f64 },

    #[error("factor weight {name} is negative or not a number: {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("label boundaries must be strictly increasing inside (0, 1): {medium}, {high}, {critical}")]
    NonMonotonicBoundaries { medium: f64, high: f64, critical: f64 },

    #[error("{name} must be within {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },

    #[error("at least one gateway must be configured")]
    NoGateways,

    #[error("duplicate alert rule name {0:?}")]
    DuplicateRule(String),

    #[error("alert rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// Why a single channel delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("channel not configured")]
    NotConfigured,

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("authentication rejected (HTTP {0})")]
    Auth(u16),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Some recipients got the message before a later one failed. Resending
    /// would duplicate it for the ones that already have it.
    #[error("delivered to {delivered} of {total} recipients: {reason}")]
    Partial {
        delivered: usize,
        total: usize,
        reason: String,
    },
}

// Client-side timeouts land here too. The dispatcher's own deadline is the one
// reported as `Timeout`, with its real duration.
impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Transport(e.to_string())
    }
}
