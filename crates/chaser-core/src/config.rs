//! Chaser configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::clock::{BusinessClock, DEFAULT_MORNING_HOUR, DEFAULT_UTC_OFFSET_MINUTES};
use crate::error::{ChaseError, Result};
use crate::plan::{
    CHASE_HORIZON_DAYS, PlanLimitTable, REMINDER_LEAD_DAYS, SHORT_FUSE_DELAY_MINUTES,
};

/// Hard ceiling on invoices fetched per batch, whatever the config says.
pub const MAX_BATCH_SIZE: usize = 500;
/// Hard ceiling on in-flight invoices inside one batch.
pub const MAX_CONCURRENCY: usize = 16;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaserConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ChaserConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            clock: ClockConfig::default(),
            dispatch: DispatchConfig::default(),
            limits: LimitsConfig::default(),
            gateway: GatewayConfig::default(),
            mailer: MailerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ChaserConfig {
    /// Load config from the default path (~/.chaser/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChaseError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChaseError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChaseError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chaser home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chaser")
    }

    /// Apply `CHASER_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(env) = get("CHASER_ENV") {
            self.environment = Environment::parse(&env);
        }
        if let Some(secret) = get("CHASER_CRON_SECRET") {
            let secret = secret.trim().to_string();
            self.gateway.cron_secret = (!secret.is_empty()).then_some(secret);
        }
        if let Some(size) = get("CHASER_BATCH_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(n) => self.dispatch.batch_size = n,
                Err(_) => tracing::warn!("⚠️ Ignoring invalid CHASER_BATCH_SIZE '{size}'"),
            }
        }
        if let Some(path) = get("CHASER_DB_PATH") {
            self.store.db_path = path;
        }
        if let Some(url) = get("CHASER_MAILER_WEBHOOK_URL") {
            self.mailer.webhook_url = url;
        }
        if let Some(token) = get("CHASER_MAILER_TOKEN") {
            self.mailer.auth_token = Some(token);
        }
    }

    /// Reject configurations the scheduler must not run with.
    pub fn validate(&self) -> Result<()> {
        self.business_clock()?;
        self.dispatch.validate()?;
        self.limits.plans.validate()?;
        if self.mailer.kind == MailerKind::Webhook && self.mailer.webhook_url.trim().is_empty() {
            return Err(ChaseError::config(
                "mailer.kind = \"webhook\" requires mailer.webhook_url",
            ));
        }
        Ok(())
    }

    pub fn business_clock(&self) -> Result<BusinessClock> {
        BusinessClock::new(self.clock.utc_offset_minutes, self.clock.morning_hour)
    }

    /// Cooldown bypass is honoured only outside production.
    pub fn cooldown_bypass_active(&self) -> bool {
        self.limits.bypass_cooldown && !self.environment.is_production()
    }
}

/// Deployment environment. Anything not recognisably development-like is production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Business clock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Fixed UTC offset of the business timezone. DST is not applied.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_morning_hour")]
    pub morning_hour: u32,
}

fn default_utc_offset_minutes() -> i32 { DEFAULT_UTC_OFFSET_MINUTES }
fn default_morning_hour() -> u32 { DEFAULT_MORNING_HOUR }

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            morning_hour: default_morning_hour(),
        }
    }
}

/// Batch dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Invoices per batch page. Clamped to `1..=MAX_BATCH_SIZE`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Invoices processed in parallel. Clamped to `1..=MAX_CONCURRENCY`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Decisions scheduled up to this far ahead are sent now; the mailer
    /// holds delivery until `send_at`.
    #[serde(default = "default_send_ahead_minutes")]
    pub send_ahead_minutes: i64,
    /// Pre-filter: oldest due date still worth fetching.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Pre-filter: furthest future due date worth fetching.
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    /// Record dry-run ledger events instead of sending.
    #[serde(default)]
    pub dry_run: bool,
    /// Built-in trigger loop period for `serve`; 0 disables it.
    #[serde(default)]
    pub interval_secs: u64,
}

fn default_batch_size() -> usize { 100 }
fn default_concurrency() -> usize { 4 }
fn default_send_ahead_minutes() -> i64 { 10 }
fn default_lookback_days() -> i64 { 63 }
fn default_lookahead_days() -> i64 { 4 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            send_ahead_minutes: default_send_ahead_minutes(),
            lookback_days: default_lookback_days(),
            lookahead_days: default_lookahead_days(),
            dry_run: false,
            interval_secs: 0,
        }
    }
}

impl DispatchConfig {
    /// The send-ahead horizon and fetch window must cover every slot the
    /// resolver can produce, or some emails are deferred or never fetched.
    pub fn validate(&self) -> Result<()> {
        if self.send_ahead_minutes < SHORT_FUSE_DELAY_MINUTES {
            return Err(ChaseError::config(format!(
                "dispatch.send_ahead_minutes must be at least {SHORT_FUSE_DELAY_MINUTES}, got {}",
                self.send_ahead_minutes
            )));
        }
        if self.lookahead_days < REMINDER_LEAD_DAYS + 1 {
            return Err(ChaseError::config(format!(
                "dispatch.lookahead_days must be at least {}, got {}",
                REMINDER_LEAD_DAYS + 1,
                self.lookahead_days
            )));
        }
        if self.lookback_days < CHASE_HORIZON_DAYS {
            return Err(ChaseError::config(format!(
                "dispatch.lookback_days must be at least {CHASE_HORIZON_DAYS}, got {}",
                self.lookback_days
            )));
        }
        Ok(())
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// Rate-limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Skip the cooldown check. Ignored in production.
    #[serde(default)]
    pub bypass_cooldown: bool,
    #[serde(flatten)]
    pub plans: PlanLimitTable,
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Shared secret for the trigger and manual endpoints.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cron_secret: None,
        }
    }
}

/// Which outbound mailer to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailerKind {
    /// POST each send request to the mail service.
    Webhook,
    /// Log the request and report success. Local testing only.
    #[default]
    Log,
}

/// Outbound mailer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    #[serde(default)]
    pub kind: MailerKind,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_mailer_timeout")]
    pub timeout_secs: u64,
}

fn default_mailer_timeout() -> u64 { 10 }

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            kind: MailerKind::default(),
            webhook_url: String::new(),
            auth_token: None,
            timeout_secs: default_mailer_timeout(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.chaser/chaser.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
