//! Starting broker-managed modules.
//!
//! A launcher only starts the process. The broker then waits for the module to connect
//! and say Hello, so a launch succeeding says nothing about the module being usable.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::process::Stdio;

use anyhow::Context;
use tokio::process::Command;

use sbwrpc::ModuleDescriptor;

/// Environment variable through which a launched module learns the broker address.
pub const BROKER_ENV: &str = "SBW_BROKER";

#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Starts `module`, telling it to connect to `broker`.
    async fn launch(&self, module: &ModuleDescriptor, broker: &str) -> anyhow::Result<()>;
}

/// An address a local child can connect to. Wildcard binds become loopback.
pub fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

/// Spawns the declared command as a child process.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, module: &ModuleDescriptor, broker: &str) -> anyhow::Result<()> {
        let Some((program, args)) = module.command.split_first() else {
            anyhow::bail!("module `{}` has no launch command", module.name);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(BROKER_ENV, broker)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}` for module `{}`", program, module.name))?;

        tracing::info!(module = %module.name, pid = ?child.id(), %broker, "spawned module process");

        let name = module.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(module = %name, "module process exited");
                }
                Ok(status) => tracing::warn!(module = %name, %status, "module process failed"),
                Err(e) => tracing::warn!(module = %name, error = %e, "failed to wait for module process"),
            }
        });

        Ok(())
    }
}
