//! Application configuration.
//!
//! Layering: defaults -> YAML file (if provided) -> env (`PROVISIONER__*`).
//! CLI overrides are applied afterwards by the caller.

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use provisioning::ProvisioningConfig;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "PROVISIONER__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset and no `-v` is given.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    /// Load the layered configuration.
    ///
    /// # Errors
    /// Fails when the file cannot be parsed or a value has the wrong shape.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .context("failed to load configuration")?;
        config
            .provisioning
            .validate()
            .map_err(|msg| anyhow::anyhow!("invalid configuration: {msg}"))?;
        Ok(config)
    }

    /// Render the effective configuration. Secrets are never serialized.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("failed to render configuration")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_load_without_file() {
        let cfg = AppConfig::load(None).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert_eq!(cfg.provisioning.ports.start, 9001);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioner.yaml");
        std::fs::write(
            &path,
            "logging:\n  format: json\nprovisioning:\n  ports:\n    start: 10000\n    end: 10010\n  call_timeout: 15s\n",
        )
        .unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.provisioning.ports.start, 10000);
        assert_eq!(cfg.provisioning.call_timeout, Duration::from_secs(15));
    }

    #[test]
    fn invalid_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "provisioning:\n  ports:\n    start: 9100\n    end: 9001\n").unwrap();

        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"), "{err}");
    }

    #[test]
    fn yaml_output_omits_client_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.yaml");
        std::fs::write(
            &path,
            "provisioning:\n  directory:\n    client_id: app\n    client_secret: hunter2\n",
        )
        .unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert!(cfg.provisioning.directory.client_secret.is_some());
        let yaml = cfg.to_yaml().unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(yaml.contains("client_id"));
    }
}
