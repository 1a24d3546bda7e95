//! # Configuration
//!
//! The broker reads its listen address, limits and module declarations from TOML:
//!
//! ```toml
//! listen = "127.0.0.1:10102"
//! start_timeout_ms = 10000
//!
//! [[modules]]
//! name = "edu.demo.trig"
//! display_name = "Trigonometry"
//! policy = "unique"
//! command = ["sbwd", "trig"]
//! ```
//!
//! Modules are configured in code through `ModuleConfig`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use sbwrpc::ManagementPolicy;
use sbwrpc::ModuleDescriptor;

use crate::transport::DEFAULT_MAX_FRAME_LEN;

/// Address used when neither configuration nor command line names one.
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:10102";

/// Name under which the broker answers instance lookups.
pub const BROKER_MODULE_NAME: &str = "BROKER";

fn default_listen() -> String {
    DEFAULT_BROKER_ADDR.to_string()
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// How long an on-demand start may take before the lookup fails.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default)]
    pub modules: Vec<ModuleDeclaration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            start_timeout_ms: default_start_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            modules: Vec::new(),
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: BrokerConfig = toml::from_str(input).context("invalid broker configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_toml_str(&input).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (index, module) in self.modules.iter().enumerate() {
            if module.name.is_empty() {
                anyhow::bail!("module #{} has no name", index + 1);
            }
            if module.name == BROKER_MODULE_NAME {
                anyhow::bail!("module name `{}` is reserved", BROKER_MODULE_NAME);
            }
            if self.modules[..index].iter().any(|m| m.name == module.name) {
                anyhow::bail!("module `{}` is declared twice", module.name);
            }
            if module.policy.broker_managed() && module.command.is_empty() {
                anyhow::bail!("module `{}` is broker-managed but has no command", module.name);
            }
        }
        if self.max_frame_len == 0 {
            anyhow::bail!("max_frame_len must be positive");
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// A module the broker knows how to find or start.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDeclaration {
    pub name: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub policy: ManagementPolicy,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub help: String,
}

impl ModuleDeclaration {
    pub fn descriptor(&self) -> ModuleDescriptor {
        let display = self.display_name.clone().unwrap_or_else(|| self.name.clone());
        let mut descriptor = ModuleDescriptor::new(&self.name, display, self.policy);
        descriptor.command = self.command.clone();
        descriptor.help = self.help.clone();
        descriptor
    }
}

/// Connection settings of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub broker: String,
    pub max_frame_len: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self { broker: DEFAULT_BROKER_ADDR.to_string(), max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

impl ModuleConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self { broker: broker.into(), ..Self::default() }
    }
}
