use std::fmt::Write as _;
use std::net::IpAddr;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::analytics::scheduler::{JobKind, JobRunner};
use crate::models::block::{BlockOutcome, UnblockOutcome};
use crate::protection::blocklist::BlockRegistry;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ipwarden/ipwarden.toml";

#[derive(Debug, Parser)]
#[command(name = "ipwarden", about = "IP-tracking and abuse-mitigation gateway", version)]
pub struct Cli {
    /// Configuration file. A missing file at the default path means defaults.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH)
    }

    /// Only an explicitly passed path has to exist.
    pub fn config_is_explicit(&self) -> bool {
        self.config.is_some()
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the gateway, admin API and scheduler (default)
    Serve,

    /// Add an address to the blocklist
    Block {
        address: IpAddr,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Deactivate a blocklist entry
    Unblock { address: IpAddr },

    /// Show active blocklist entries
    List {
        /// Include inactive entries
        #[arg(long)]
        all: bool,
    },

    /// Run one analysis job now (detect, escalate or purge)
    RunJob { job: JobKind },
}

/// Execute a one-shot administrative command and return its output text.
pub fn run_command(command: &Command, registry: &BlockRegistry, jobs: &JobRunner) -> Result<String> {
    let mut out = String::new();
    match command {
        Command::Block { address, reason } => {
            let address = address.to_canonical();
            match registry.block(address, reason)? {
                BlockOutcome::Created => writeln!(out, "Successfully blocked IP: {}", address)?,
                BlockOutcome::Reactivated => writeln!(out, "Reactivated block for IP: {}", address)?,
                BlockOutcome::AlreadyBlocked => writeln!(out, "IP address {} is already blocked", address)?,
            }
        }
        Command::Unblock { address } => {
            let address = address.to_canonical();
            match registry.unblock(address)? {
                UnblockOutcome::Unblocked => writeln!(out, "Successfully unblocked IP: {}", address)?,
                UnblockOutcome::NotFound => writeln!(out, "IP address {} is not in the blocklist", address)?,
            }
        }
        Command::List { all } => {
            let entries = registry.list(!*all)?;
            if entries.is_empty() {
                writeln!(out, "No blocked IP addresses")?;
            } else {
                writeln!(out, "Blocked IP addresses ({}):", entries.len())?;
                for e in entries {
                    let reason = if e.reason.is_empty() { "No reason provided" } else { e.reason.as_str() };
                    let state = if e.active { "" } else { " [inactive]" };
                    writeln!(
                        out,
                        "  {} - {} (blocked on {}){}",
                        e.address,
                        reason,
                        e.created_at.format("%Y-%m-%d %H:%M:%S"),
                        state
                    )?;
                }
            }
        }
        Command::RunJob { job } => {
            let outcome = jobs.run(*job)?;
            writeln!(out, "Job {} finished: {}", job, outcome)?;
        }
        Command::Serve => bail!("serve is not a one-shot command"),
    }
    Ok(out)
}
