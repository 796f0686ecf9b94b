//! Configuration for the provisioning module.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Module configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    pub ports: PortPoolConfig,
    pub retry: RetryConfig,
    pub consumer: ConsumerConfig,

    /// Upper bound for every call to the directory, executor and registrar.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    pub ssh: SshConfig,
    pub routes: RoutesConfig,
    pub directory: DirectoryConfig,
    pub queue: QueueConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ports: PortPoolConfig::default(),
            retry: RetryConfig::default(),
            consumer: ConsumerConfig::default(),
            call_timeout: Duration::from_secs(120),
            ssh: SshConfig::default(),
            routes: RoutesConfig::default(),
            directory: DirectoryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    /// Reject configurations the pipeline cannot run with.
    ///
    /// # Errors
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.ports.start > self.ports.end {
            return Err(format!(
                "ports.start ({}) must not exceed ports.end ({})",
                self.ports.start, self.ports.end
            ));
        }
        if self.ports.start == 0 {
            return Err("ports.start must be non-zero".to_owned());
        }
        if self.consumer.workers == 0 {
            return Err("consumer.workers must be at least 1".to_owned());
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err("retry.base_backoff must not exceed retry.max_backoff".to_owned());
        }
        if self.call_timeout.is_zero() {
            return Err("call_timeout must be non-zero".to_owned());
        }
        Ok(())
    }
}

/// Contiguous pool of host ports handed out to active users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortPoolConfig {
    /// First port of the pool (inclusive).
    pub start: u16,
    /// Last port of the pool (inclusive).
    pub end: u16,
    /// JSON file holding the allocation table. In-memory when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            start: 9001,
            end: 9100,
            store_path: None,
        }
    }
}

/// Redelivery policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Redeliveries after the first attempt before a task is dead-lettered.
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Maximum number of tasks processed concurrently.
    pub workers: usize,

    /// Sleep between polls when the queue is empty.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Remote host reached over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key used for authentication (fetched from the secret store at deploy time).
    pub identity_file: Option<PathBuf>,
    /// Remote script invoked as `<cmd> <username> <port>`.
    pub bring_up_command: String,
    /// Remote script invoked as `<cmd> <username>`.
    pub tear_down_command: String,
    /// Additional `-o Key=Value` options passed to ssh.
    pub options: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 22,
            user: "provisioner".to_owned(),
            identity_file: None,
            bring_up_command: "/opt/smyth/bin/provision-user.sh".to_owned(),
            tear_down_command: "/opt/smyth/bin/deprovision-user.sh".to_owned(),
            options: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Reverse proxy file-provider directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutesConfig {
    /// Directory watched by the proxy.
    pub dir: PathBuf,
    /// Public domain; users are served at `<username>.<domain>`.
    pub domain: String,
    /// Host the proxy uses to reach user containers.
    pub backend_host: String,
    pub entry_points: Vec<String>,
    pub cert_resolver: Option<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/traefik/dynamic"),
            domain: "localhost".to_owned(),
            backend_host: "127.0.0.1".to_owned(),
            entry_points: vec!["websecure".to_owned()],
            cert_resolver: None,
        }
    }
}

/// Graph-style identity directory reached over HTTPS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: Option<SecretString>,
    pub scope: String,
    /// Prefix of custom attribute names, e.g. `extension_<app-id>_`.
    pub extension_prefix: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_owned(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: None,
            scope: "https://graph.microsoft.com/.default".to_owned(),
            extension_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Root of the durable spool (`queue/` and `dead-letter/` live below it).
    pub spool_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("data/spool"),
        }
    }
}

/// `Duration` <-> human-readable strings (`"30s"`, `"5m"`).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    /// # Errors
    /// Fails when the string is not a valid humantime duration.
    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(&humantime::format_duration(*d))
    }
}
