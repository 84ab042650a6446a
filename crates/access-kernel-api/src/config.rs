use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use time::Duration;

pub const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 2_557;
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

/// Runtime knobs for an [`crate::AccessKernel`]. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub audit_retention_days: u32,
    pub max_share_lifetime_hours: Option<u32>,
    pub busy_timeout_ms: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            max_share_lifetime_hours: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns an error for malformed YAML, unknown keys, or out-of-range values.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse kernel config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or its contents are invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel config {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid kernel config {}", path.display()))
    }

    /// # Errors
    /// Returns an error naming the first field out of range.
    pub fn validate(&self) -> Result<()> {
        if self.audit_retention_days == 0 {
            return Err(anyhow!("audit_retention_days MUST be >= 1"));
        }
        if self.busy_timeout_ms == 0 {
            return Err(anyhow!("busy_timeout_ms MUST be >= 1"));
        }
        if self.max_share_lifetime_hours == Some(0) {
            return Err(anyhow!("max_share_lifetime_hours MUST be >= 1 when set"));
        }
        Ok(())
    }

    #[must_use]
    pub fn max_share_lifetime(&self) -> Option<Duration> {
        self.max_share_lifetime_hours.map(|hours| Duration::hours(i64::from(hours)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn empty_document_yields_defaults() -> Result<()> {
        let config = KernelConfig::from_yaml_str("{}")?;
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.audit_retention_days, 2_557);
        assert_eq!(config.max_share_lifetime(), None);
        Ok(())
    }

    // Test IDs: TCFG-002
    #[test]
    fn partial_document_overrides_named_fields() -> Result<()> {
        let config =
            KernelConfig::from_yaml_str("max_share_lifetime_hours: 72\nbusy_timeout_ms: 250\n")?;
        assert_eq!(config.max_share_lifetime(), Some(Duration::hours(72)));
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.audit_retention_days, DEFAULT_AUDIT_RETENTION_DAYS);
        Ok(())
    }

    // Test IDs: TCFG-003
    #[test]
    fn rejects_zero_values_and_unknown_keys() {
        assert!(KernelConfig::from_yaml_str("audit_retention_days: 0").is_err());
        assert!(KernelConfig::from_yaml_str("busy_timeout_ms: 0").is_err());
        assert!(KernelConfig::from_yaml_str("max_share_lifetime_hours: 0").is_err());
        assert!(KernelConfig::from_yaml_str("retention: 5").is_err());
    }

    // Test IDs: TCFG-004
    #[test]
    fn load_reads_file_from_disk() -> Result<()> {
        let path =
            std::env::temp_dir().join(format!("access-kernel-config-{}.yaml", ulid::Ulid::new()));
        fs::write(&path, "audit_retention_days: 30\n")?;
        let config = KernelConfig::load(&path)?;
        assert_eq!(config.audit_retention_days, 30);
        fs::remove_file(&path)?;
        Ok(())
    }
}
