//! Operator CLI for the hypervisor control plane.
//!
//! Every subcommand prints its result as JSON on stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hvplane::{ControlPlane, HvOptions, init_logging};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "hvctl", about = "Drive guests and accelerators on a hypervisor host")]
struct Cli {
    /// Options file; defaults to $HVPLANE_CONFIG, then the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the host address from the options file
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List guests registered with the host
    Guests,
    /// List the configured accelerator kinds
    Kinds,
    /// List physical functions of an accelerator kind
    Pfs { kind: String },
    /// Create VFs on one PF and enable passthrough on each
    CreateVfs {
        kind: String,
        pf_index: usize,
        count: usize,
    },
    /// Set a PF's VF count back to zero
    DestroyVfs { kind: String, pf_index: usize },
    /// Power on a guest and wait for it to answer
    Start {
        guest: String,
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Gracefully shut a guest down
    Shutdown {
        guest: String,
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Unregister a guest from the host
    Undefine { guest: String },
    /// Run a command inside a guest
    Exec {
        guest: String,
        command: String,
        #[arg(long, default_value = ".")]
        cwd: String,
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Run a command inside several guests concurrently
    FleetExec {
        command: String,
        /// Guests to target
        #[arg(long, num_args = 1.., required = true)]
        guests: Vec<String>,
        #[arg(long, default_value = ".")]
        cwd: String,
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Done<'a> {
    operation: &'a str,
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut options = HvOptions::load(cli.config.as_deref()).context("failed to load options")?;
    if let Some(host) = cli.host {
        options.host.address = host;
    }
    let _log_guard = init_logging(options.log_dir.as_deref())?;

    let plane = ControlPlane::new(options)?;
    let controller = plane.controller();
    let pool = plane.pool();

    match cli.command {
        Command::Guests => print_json(&controller.list_host_guests().await?),
        Command::Kinds => print_json(&pool.kinds().names()),
        Command::Pfs { kind } => print_json(
            &pool
                .list_physical_functions(&kind)
                .await
                .with_context(|| format!("failed to list {} PFs", kind))?,
        ),
        Command::CreateVfs {
            kind,
            pf_index,
            count,
        } => print_json(
            &pool
                .create_vfs(&kind, pf_index, count)
                .await
                .with_context(|| format!("failed to create {} {} VFs on PF {}", count, kind, pf_index))?,
        ),
        Command::DestroyVfs { kind, pf_index } => {
            pool.destroy_vfs(&kind, pf_index).await?;
            print_json(&Done {
                operation: "destroy-vfs",
                target: format!("{}:{}", kind, pf_index),
            })
        }
        Command::Start { guest, timeout } => {
            controller.start(&guest, timeout).await?;
            print_json(&Done {
                operation: "start",
                target: guest,
            })
        }
        Command::Shutdown { guest, timeout } => {
            controller.shutdown(&guest, timeout).await?;
            print_json(&Done {
                operation: "shutdown",
                target: guest,
            })
        }
        Command::Undefine { guest } => {
            controller.undefine(&guest).await?;
            print_json(&Done {
                operation: "undefine",
                target: guest,
            })
        }
        Command::Exec {
            guest,
            command,
            cwd,
            timeout,
        } => print_json(&controller.execute(&guest, &command, &cwd, timeout).await?),
        Command::FleetExec {
            command,
            guests,
            cwd,
            timeout,
        } => {
            let fleet = plane.fleet(hvplane::Fleet::new("cli", guests));
            let results = fleet.execute_all(&command, &cwd, timeout, None).await;
            let missing: Vec<String> = results.missing().iter().map(|g| g.to_string()).collect();
            let metrics = results.metrics.clone();
            print_json(&serde_json::json!({
                "results": results.into_map(),
                "missing": missing,
                "metrics": metrics,
            }))
        }
    }
}
