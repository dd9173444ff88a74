//! The single RON configuration file.
//!
//! ```ron
//! (
//!     base_path: "/var/lib/postern",
//!     frontend: (listeners: [(address: "smtp://0.0.0.0:25")]),
//!     queue: (msg_timeout: 600, max_req_timeout: 3600),
//!     delivery: (max_concurrent: 32),
//!     scanner: (enabled: true, addresses: ["127.0.0.1:3310"]),
//! )
//! ```

use std::path::{Path, PathBuf};

use postern_cluster::ClusterConfig;
use postern_common::error::ConfigError;
use postern_delivery::DeliveryConfig;
use postern_queue::{ChannelSpec, QueueConfig};
use postern_scanner::ScannerConfig;
use postern_smtp::FrontendConfig;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "POSTERN_CONFIG";

/// Searched in order when neither `--config` nor [`CONFIG_ENV`] is given.
pub const DEFAULT_PATHS: [&str; 2] = ["./postern.config.ron", "/etc/postern/postern.config.ron"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Holds the `queue` and `tls` directories.
    ///
    /// Default: `/var/lib/postern`
    #[serde(default = "defaults::base_path")]
    pub base_path: PathBuf,

    /// Initialise empty queue storage instead of refusing to start.
    #[serde(default)]
    pub auto_create: bool,

    #[serde(default)]
    pub frontend: FrontendConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: defaults::base_path(),
            auto_create: false,
            frontend: FrontendConfig::default(),
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            scanner: ScannerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Work out which file to read.
    ///
    /// # Errors
    /// [`ConfigError::NotFound`] when an explicit path does not exist or no
    /// default location has a file
    pub fn locate(cli: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let defaults = DEFAULT_PATHS.map(PathBuf::from);
        locate_from(cli, env, &defaults)
    }

    /// # Errors
    /// If the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// # Errors
    /// If `content` is not a valid configuration
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// # Errors
    /// [`ConfigError::NothingToDo`] when both the frontend and delivery are
    /// disabled, otherwise the first section that fails validation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frontend.enabled && !self.delivery.enabled {
            return Err(ConfigError::NothingToDo);
        }

        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("base_path", "must not be empty"));
        }

        self.frontend.validate()?;
        self.queue.validate()?;
        self.delivery.validate()?;
        self.scanner.validate()?;
        self.cluster.validate()?;

        Ok(())
    }

    pub fn queue_path(&self) -> PathBuf {
        self.base_path.join("queue")
    }

    pub fn tls_path(&self) -> PathBuf {
        self.base_path.join("tls")
    }

    /// Every channel that must exist before components start: the declared
    /// ones, then any the frontend or delivery name under the default topic.
    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        let mut specs = self.queue.channels.clone();

        let mut used: Vec<&str> = Vec::new();
        if self.frontend.enabled {
            used.push(&self.frontend.channel);
        }
        if self.delivery.enabled {
            used.extend(self.delivery.channels.iter().map(String::as_str));
        }

        for name in used {
            if !specs.iter().any(|spec| spec.name == name) {
                specs.push(ChannelSpec::new(self.queue.default_topic.clone(), name));
            }
        }

        specs
    }
}

fn locate_from(
    cli: Option<&Path>,
    env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = cli {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::NotFound(format!("  - {} (--config)", path.display())))
        };
    }

    if let Some(path) = env {
        return if path.exists() {
            Ok(path)
        } else {
            Err(ConfigError::NotFound(format!(
                "  - {} ({CONFIG_ENV})",
                path.display()
            )))
        };
    }

    defaults
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| {
            ConfigError::NotFound(
                defaults
                    .iter()
                    .map(|path| format!("  - {}", path.display()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })
}

mod defaults {
    use std::path::PathBuf;

    pub fn base_path() -> PathBuf {
        PathBuf::from("/var/lib/postern")
    }
}
