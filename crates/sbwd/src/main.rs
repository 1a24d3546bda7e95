//! # sbwd
//!
//! One binary for every role in the module network:
//!
//! - `sbwd broker` runs the broker.
//! - `sbwd trig` runs the demonstration trigonometry module.
//! - `sbwd list` prints what a running broker knows about.
//!
//! Modules started by the broker find it through the `SBW_BROKER` variable, so a
//! declaration such as `command = ["sbwd", "trig"]` needs no further arguments.

mod trig;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

use sbwrpc::ManagementPolicy;
use sbwrun::Broker;
use sbwrun::BrokerConfig;
use sbwrun::Module;
use sbwrun::ModuleConfig;
use sbwrun::config::DEFAULT_BROKER_ADDR;
use sbwrun::launcher::BROKER_ENV;

#[derive(Parser, Debug)]
#[command(name = "sbwd", version, about = "Broker and tools for the SBW module network")]
struct Cli {
    /// Log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker.
    Broker {
        /// Address to listen on. Overrides the configuration file.
        #[arg(long)]
        listen: Option<String>,

        /// TOML file with broker settings and module declarations.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run the demonstration trigonometry module.
    Trig {
        /// Broker address.
        #[arg(long, env = BROKER_ENV, default_value = DEFAULT_BROKER_ADDR)]
        broker: String,
    },
    /// Print the modules and services a running broker knows about.
    List {
        /// Broker address.
        #[arg(long, env = BROKER_ENV, default_value = DEFAULT_BROKER_ADDR)]
        broker: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Broker { listen, config } => run_broker(listen, config).await,
        Command::Trig { broker } => run_trig(&broker).await,
        Command::List { broker } => run_list(&broker).await,
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_broker(listen: Option<String>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => BrokerConfig::load(&path)?,
        None => BrokerConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    config.validate()?;
    tracing::info!(listen = %config.listen, declared = config.modules.len(), "starting broker");

    let broker = Broker::new(config);
    let stopper = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });
    broker.listen().await
}

async fn run_trig(broker: &str) -> anyhow::Result<()> {
    let module = trig::module().await?;
    let id = module
        .connect(&ModuleConfig::new(broker))
        .await
        .with_context(|| format!("cannot join the broker at {}", broker))?;
    tracing::info!(%id, module = trig::MODULE_NAME, "serving");

    tokio::select! {
        _ = module.run_until_disconnected() => tracing::info!("broker went away"),
        _ = tokio::signal::ctrl_c() => module.disconnect().await,
    }
    Ok(())
}

async fn run_list(broker: &str) -> anyhow::Result<()> {
    let module = Module::new("sbwd.list", "Module lister", ManagementPolicy::SelfManaged);
    module
        .connect(&ModuleConfig::new(broker))
        .await
        .with_context(|| format!("cannot join the broker at {}", broker))?;

    println!("declared modules:");
    for descriptor in module.list_modules().await? {
        println!("  {:<24} {:<14} {}", descriptor.name, format!("{:?}", descriptor.policy), descriptor.display_name);
    }

    println!("running instances:");
    for id in module.module_instance_ids().await? {
        let instance = module.module(id)?;
        let descriptor = instance.descriptor().await?;
        println!("  {} {}", id, descriptor.name);
        for service in instance.services().await? {
            println!("    {} [{}]", service.name, service.category);
            for method in &service.methods {
                println!("      {}", method.signature);
            }
        }
    }

    module.disconnect().await;
    Ok(())
}
