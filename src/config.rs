use chrono::Duration;
use serde::Deserialize;
use std::path::Path;

use crate::alerts::rules::{ChannelKind, RuleConfig, RuleKind, Severity};
use crate::error::ConfigError;

/// Longest trailing or dedup window accepted, one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 86_400;
/// Longest history retention accepted.
pub const MAX_AGE_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub scoring: ScoringConfig,
    pub history: HistoryConfig,
    pub signature: SignatureConfig,
    pub routing: RoutingConfig,
    pub alerts: AlertConfig,
    pub channels: ChannelsConfig,
    pub database: DatabaseConfig,
    pub data: DataConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: FactorWeights,
    pub boundaries: LabelBoundaries,
    /// Below this many branch records, time/branch/amount/velocity fall back to defaults.
    pub min_samples: usize,
    /// Used when neither the branch nor the network has enough data.
    pub default_risk: f64,
    pub velocity_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct FactorWeights {
    pub time: f64,
    pub branch: f64,
    pub amount: f64,
    pub velocity: f64,
    pub pattern: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct LabelBoundaries {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_records: usize,
    pub max_age_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignatureConfig {
    pub deviation_threshold: f64,
    pub min_samples: u64,
    pub seen_id_capacity: usize,
    pub amount_bucket_width: f64,
    pub pattern_min_failures: u32,
    /// Smoothing factor for the failure-velocity EWMA.
    pub velocity_alpha: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingConfig {
    pub switch_threshold: f64,
    /// Branch failure rate above which the branch should be watched.
    pub monitor_rate: f64,
    /// Branch failure rate above which its traffic should go to a backup.
    pub reroute_rate: f64,
    /// Ordered: primary first, then backups. `healthy` is the initial state only.
    pub gateways: Vec<GatewayConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub dedup_window_secs: u64,
    pub dispatch_timeout_ms: u64,
    pub retry_count: u32,
    pub rules: Vec<RuleConfig>,
    pub routing: SeverityRouting,
}

/// Channels for warning and info alerts. Critical always goes to every registered channel.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SeverityRouting {
    pub warning: Vec<ChannelKind>,
    pub info: Vec<ChannelKind>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub slack: SlackConfig,
    pub sms: SmsConfig,
    pub desktop: DesktopConfig,
    pub log: LogChannelConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DesktopConfig {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogChannelConfig {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    /// Historical export folded into signatures and history before the replay.
    pub history_csv: Option<String>,
    pub transactions_csv: Option<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            boundaries: LabelBoundaries::default(),
            min_samples: 30,
            default_risk: 0.5,
            velocity_window_secs: 300,
        }
    }
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            time: 0.30,
            branch: 0.25,
            amount: 0.20,
            velocity: 0.15,
            pattern: 0.10,
        }
    }
}

impl FactorWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("time", self.time),
            ("branch", self.branch),
            ("amount", self.amount),
            ("velocity", self.velocity),
            ("pattern", self.pattern),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }
        let sum: f64 = named.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

impl Default for LabelBoundaries {
    fn default() -> Self {
        Self {
            medium: 0.3,
            high: 0.6,
            critical: 0.8,
        }
    }
}

impl LabelBoundaries {
    /// Cut points must satisfy `0 < medium < high < critical < 1`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.medium > 0.0
            && self.medium < self.high
            && self.high < self.critical
            && self.critical < 1.0;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::NonMonotonicBoundaries {
                medium: self.medium,
                high: self.high,
                critical: self.critical,
            })
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: 5000,
            max_age_days: 30,
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: 3.0,
            min_samples: 30,
            seen_id_capacity: 10_000,
            amount_bucket_width: 50.0,
            pattern_min_failures: 3,
            velocity_alpha: 0.2,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            switch_threshold: 0.8,
            monitor_rate: 0.10,
            reroute_rate: 0.15,
            gateways: vec![
                GatewayConfig {
                    id: "primary".into(),
                    healthy: true,
                },
                GatewayConfig {
                    id: "secondary".into(),
                    healthy: true,
                },
            ],
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_window_secs: 3600,
            dispatch_timeout_ms: 5000,
            retry_count: 0,
            rules: default_rules(),
            routing: SeverityRouting::default(),
        }
    }
}

impl Default for SeverityRouting {
    fn default() -> Self {
        Self {
            warning: vec![ChannelKind::Telegram, ChannelKind::Slack, ChannelKind::Log],
            info: vec![ChannelKind::Log],
        }
    }
}

impl Default for LogChannelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/txguard.db".into(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            history_csv: None,
            transactions_csv: Some("data/transactions.csv".into()),
        }
    }
}

/// The stock rules with their usual severities.
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            name: "failure-rate".into(),
            kind: RuleKind::FailureRate {
                threshold: 0.05,
                window_secs: 3600,
                min_transactions: 10,
            },
            severity: Severity::Warning,
            channels: None,
        },
        RuleConfig {
            name: "risk-critical".into(),
            kind: RuleKind::RiskCritical,
            severity: Severity::Critical,
            channels: None,
        },
        RuleConfig {
            name: "anomaly-flagged".into(),
            kind: RuleKind::AnomalyFlagged,
            severity: Severity::Warning,
            channels: None,
        },
        RuleConfig {
            name: "velocity-spike".into(),
            kind: RuleKind::VelocitySpike {
                ratio: 5.0,
                min_transactions: 5,
            },
            severity: Severity::Info,
            channels: None,
        },
        RuleConfig {
            name: "hourly-failure-spike".into(),
            kind: RuleKind::HourlyFailureSpike {
                sigma: 2.0,
                min_transactions: 10,
            },
            severity: Severity::Warning,
            channels: None,
        },
        RuleConfig {
            name: "failure-surge".into(),
            kind: RuleKind::FailureSurge {
                factor: 1.2,
                window_secs: 7 * 86_400,
                min_transactions: 20,
            },
            severity: Severity::Warning,
            channels: None,
        },
        RuleConfig {
            name: "shared-failure-pattern".into(),
            kind: RuleKind::SharedFailurePattern { min_similarity: 0.7 },
            severity: Severity::Info,
            channels: None,
        },
    ]
}

/// Checked seconds-to-`Duration` for windows, bounded by `MAX_WINDOW_SECS`.
pub fn window(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    let out_of_range = || ConfigError::OutOfRange {
        name,
        range: "[1, 31622400] s",
        value: secs as f64,
    };
    if secs == 0 || secs > MAX_WINDOW_SECS {
        return Err(out_of_range());
    }
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(out_of_range)
}

impl ScoringConfig {
    pub fn velocity_window(&self) -> Result<Duration, ConfigError> {
        window("scoring.velocity_window_secs", self.velocity_window_secs)
    }
}

impl AlertConfig {
    pub fn dedup_window(&self) -> Result<Duration, ConfigError> {
        window("alerts.dedup_window_secs", self.dedup_window_secs)
    }
}

impl HistoryConfig {
    pub fn max_age(&self) -> Result<Duration, ConfigError> {
        if !(1..=MAX_AGE_DAYS).contains(&self.max_age_days) {
            return Err(ConfigError::OutOfRange {
                name: "history.max_age_days",
                range: "[1, 36500]",
                value: self.max_age_days as f64,
            });
        }
        Duration::try_days(self.max_age_days).ok_or(ConfigError::OutOfRange {
            name: "history.max_age_days",
            range: "[1, 36500]",
            value: self.max_age_days as f64,
        })
    }
}

impl Config {
    /// Load config from a TOML file. A missing file means defaults; a broken one is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Self::default()
        } else {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let parsed: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            tracing::info!("Config loaded from {}", path.display());
            parsed
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill channel credentials missing from the file from the environment.
    pub fn apply_env(&mut self) {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        let tg = &mut self.channels.telegram;
        if tg.bot_token.is_none() {
            tg.bot_token = env("TELEGRAM_BOT_TOKEN");
        }
        if tg.chat_id.is_none() {
            tg.chat_id = env("TELEGRAM_CHAT_ID");
        }
        let slack = &mut self.channels.slack;
        if slack.webhook_url.is_none() {
            slack.webhook_url = env("SLACK_WEBHOOK_URL");
        }
        let sms = &mut self.channels.sms;
        if sms.account_sid.is_none() {
            sms.account_sid = env("TWILIO_ACCOUNT_SID");
        }
        if sms.auth_token.is_none() {
            sms.auth_token = env("TWILIO_AUTH_TOKEN");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.weights.validate()?;
        self.scoring.boundaries.validate()?;
        check_unit("scoring.default_risk", self.scoring.default_risk)?;
        check_unit("routing.switch_threshold", self.routing.switch_threshold)?;
        check_unit("routing.monitor_rate", self.routing.monitor_rate)?;
        check_unit("routing.reroute_rate", self.routing.reroute_rate)?;
        if self.routing.monitor_rate > self.routing.reroute_rate {
            return Err(ConfigError::OutOfRange {
                name: "routing.monitor_rate",
                range: "[0, routing.reroute_rate]",
                value: self.routing.monitor_rate,
            });
        }
        if self.routing.gateways.is_empty() {
            return Err(ConfigError::NoGateways);
        }
        self.scoring.velocity_window()?;
        if self.history.max_records == 0 {
            return Err(ConfigError::OutOfRange {
                name: "history.max_records",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        self.history.max_age()?;
        let sig = &self.signature;
        if !(sig.deviation_threshold.is_finite() && sig.deviation_threshold > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "signature.deviation_threshold",
                range: "(0, inf)",
                value: sig.deviation_threshold,
            });
        }
        if !(sig.amount_bucket_width.is_finite() && sig.amount_bucket_width > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "signature.amount_bucket_width",
                range: "(0, inf)",
                value: sig.amount_bucket_width,
            });
        }
        if !(sig.velocity_alpha > 0.0 && sig.velocity_alpha <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "signature.velocity_alpha",
                range: "(0, 1]",
                value: sig.velocity_alpha,
            });
        }
        if sig.seen_id_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                name: "signature.seen_id_capacity",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        self.alerts.dedup_window()?;
        if self.alerts.dispatch_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                name: "alerts.dispatch_timeout_ms",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        crate::alerts::rules::RuleTable::new(self.alerts.rules.clone())?;
        Ok(())
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            range: "[0, 1]",
            value,
        })
    }
}
