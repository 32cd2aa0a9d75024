//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
///
/// Every section is optional; missing values fall back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub auto_return: AutoReturnConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rpc_endpoint(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Session lifetime and expiry warning settings
#[derive(Debug, Clone, Deserialize)]
pub struct GuardianConfig {
    /// How long before expiry the "about to expire" warning fires
    #[serde(default = "default_warn_lead_ms")]
    pub warn_lead_ms: u64,

    /// Pause every dependent automation rule when a session expires
    #[serde(default)]
    pub auto_pause_on_expiry: bool,

    /// TTL applied when arm() is called without one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_min_ttl_ms")]
    pub min_ttl_ms: u64,

    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: u64,
}

impl GuardianConfig {
    pub fn warn_lead(&self) -> Duration {
        Duration::from_millis(self.warn_lead_ms)
    }

    /// Resolve a requested TTL into the configured bounds
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        let requested_ms = requested
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.default_ttl_ms);
        Duration::from_millis(requested_ms.clamp(self.min_ttl_ms, self.max_ttl_ms))
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            warn_lead_ms: default_warn_lead_ms(),
            auto_pause_on_expiry: false,
            default_ttl_ms: default_ttl_ms(),
            min_ttl_ms: default_min_ttl_ms(),
            max_ttl_ms: default_max_ttl_ms(),
        }
    }
}

/// Pre-expiry sweep timing
#[derive(Debug, Clone, Deserialize)]
pub struct AutoReturnConfig {
    /// Run the sweep this long before the session expires
    #[serde(default = "default_preempt_ms")]
    pub preempt_ms: u64,

    /// Margin kept free for send latency before expiry
    #[serde(default = "default_safety_ms")]
    pub safety_ms: u64,

    /// Settle delay before the first attempt (shrunk when time is short)
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Time one sweep attempt is expected to need
    #[serde(default = "default_attempt_budget_ms")]
    pub attempt_budget_ms: u64,

    /// Retry when an attempt produced no transaction ids
    #[serde(default = "default_true")]
    pub retry_on_empty: bool,

    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl AutoReturnConfig {
    pub fn preempt(&self) -> Duration {
        Duration::from_millis(self.preempt_ms)
    }

    pub fn safety(&self) -> Duration {
        Duration::from_millis(self.safety_ms)
    }

    /// Minimum time that must remain for one attempt plus the optional retry
    pub fn required_budget_ms(&self) -> u64 {
        let retry = if self.retry_on_empty && self.retry_max > 0 {
            self.retry_delay_ms + self.attempt_budget_ms
        } else {
            0
        };
        self.safety_ms + self.attempt_budget_ms + retry
    }
}

impl Default for AutoReturnConfig {
    fn default() -> Self {
        Self {
            preempt_ms: default_preempt_ms(),
            safety_ms: default_safety_ms(),
            grace_ms: default_grace_ms(),
            attempt_budget_ms: default_attempt_budget_ms(),
            retry_on_empty: true,
            retry_max: default_retry_max(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Sweep amounts and asset classes
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Lamports held back from the native balance to pay fees
    #[serde(default = "default_fee_buffer")]
    pub fee_buffer_lamports: u64,

    /// Lamports never swept out of the hot wallet; at least the rent-exempt
    /// minimum or the native transfer is rejected
    #[serde(default = "default_min_keep")]
    pub min_keep_lamports: u64,

    /// Mints swept after every other token
    #[serde(default = "default_stable_mints")]
    pub stable_mints: Vec<String>,

    /// Mints never swept
    #[serde(default)]
    pub excluded_mints: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            fee_buffer_lamports: default_fee_buffer(),
            min_keep_lamports: default_min_keep(),
            stable_mints: default_stable_mints(),
            excluded_mints: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// HMAC key for the audit chain (set via ARMGUARD__AUDIT__HMAC_SECRET)
    #[serde(default)]
    pub hmac_secret: String,

    #[serde(default = "default_audit_path")]
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            hmac_secret: String::new(),
            path: default_audit_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_wallets_path")]
    pub wallets_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wallets_path: default_wallets_path(),
        }
    }
}

// Default value functions
fn default_rpc_endpoint() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_warn_lead_ms() -> u64 {
    120_000
}

fn default_ttl_ms() -> u64 {
    3_600_000
}

fn default_min_ttl_ms() -> u64 {
    1_000
}

fn default_max_ttl_ms() -> u64 {
    86_400_000
}

fn default_preempt_ms() -> u64 {
    8_000
}

fn default_safety_ms() -> u64 {
    500
}

fn default_grace_ms() -> u64 {
    1_500
}

fn default_attempt_budget_ms() -> u64 {
    2_500
}

fn default_retry_max() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1_500
}

fn default_fee_buffer() -> u64 {
    10_000
}

// Rent-exempt minimum of a zero-data system account.
fn default_min_keep() -> u64 {
    890_880
}

fn default_stable_mints() -> Vec<String> {
    vec![
        // USDC
        "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
        // USDT
        "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB".to_string(),
    ]
}

fn default_audit_path() -> String {
    "data/audit.jsonl".to_string()
}

fn default_wallets_path() -> String {
    "credentials/wallets.json".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix ARMGUARD_)
            .add_source(
                config::Environment::with_prefix("ARMGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let guardian = &self.guardian;
        if guardian.max_ttl_ms < guardian.min_ttl_ms {
            anyhow::bail!(
                "max_ttl_ms ({}) must not be below min_ttl_ms ({})",
                guardian.max_ttl_ms,
                guardian.min_ttl_ms
            );
        }
        if guardian.default_ttl_ms < guardian.min_ttl_ms
            || guardian.default_ttl_ms > guardian.max_ttl_ms
        {
            anyhow::bail!(
                "default_ttl_ms ({}) must lie within [{}, {}]",
                guardian.default_ttl_ms,
                guardian.min_ttl_ms,
                guardian.max_ttl_ms
            );
        }

        if self.auto_return.preempt_ms <= self.auto_return.safety_ms {
            anyhow::bail!(
                "auto_return.preempt_ms ({}) must exceed safety_ms ({})",
                self.auto_return.preempt_ms,
                self.auto_return.safety_ms
            );
        }

        for mint in self.sweep.stable_mints.iter().chain(&self.sweep.excluded_mints) {
            Pubkey::from_str(mint).with_context(|| format!("Invalid mint address: {}", mint))?;
        }

        if let Some(mint) = self
            .sweep
            .stable_mints
            .iter()
            .find(|m| self.sweep.excluded_mints.contains(m))
        {
            anyhow::bail!("Mint {} is listed as both stable and excluded", mint);
        }

        if self.audit.hmac_secret.is_empty() {
            tracing::warn!(
                "audit.hmac_secret is empty - audit chain hashes are not keyed to this deployment"
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  RPC:
    endpoint: {}
    timeout: {}ms
  Guardian:
    warn_lead: {}ms
    auto_pause_on_expiry: {}
    ttl: default {}ms, range [{}ms, {}ms]
  Auto-Return:
    preempt: {}ms
    safety: {}ms
    grace: {}ms
    retry_on_empty: {} (max {}, delay {}ms)
  Sweep:
    fee_buffer: {} lamports
    min_keep: {} lamports
    stable_mints: {:?}
    excluded_mints: {:?}
  Audit:
    path: {}
    hmac_secret: {}
  Storage:
    wallets: {}
"#,
            mask_url(&self.rpc.endpoint),
            self.rpc.timeout_ms,
            self.guardian.warn_lead_ms,
            self.guardian.auto_pause_on_expiry,
            self.guardian.default_ttl_ms,
            self.guardian.min_ttl_ms,
            self.guardian.max_ttl_ms,
            self.auto_return.preempt_ms,
            self.auto_return.safety_ms,
            self.auto_return.grace_ms,
            self.auto_return.retry_on_empty,
            self.auto_return.retry_max,
            self.auto_return.retry_delay_ms,
            self.sweep.fee_buffer_lamports,
            self.sweep.min_keep_lamports,
            self.sweep.stable_mints,
            self.sweep.excluded_mints,
            self.audit.path,
            if self.audit.hmac_secret.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.storage.wallets_path,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            guardian: GuardianConfig::default(),
            auto_return: AutoReturnConfig::default(),
            sweep: SweepConfig::default(),
            audit: AuditConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}
