//! Remedy Control - CLI client for the remediation daemon
//!
//! Talks to remedyd over HTTP; `check-command` and `match` run locally.

mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::RemedydClient;

const DEFAULT_URL: &str = "http://127.0.0.1:7870";

#[derive(Parser)]
#[command(name = "remedyctl")]
#[command(about = "Remedy - automated support-ticket remediation", long_about = None)]
#[command(version = remedy_common::VERSION)]
struct Cli {
    /// remedyd base URL
    #[arg(long, global = true, env = "REMEDYD_URL", default_value = DEFAULT_URL)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health
    Status,

    /// Show processing metrics
    Metrics {
        #[arg(long)]
        json: bool,

        /// Raw Prometheus exposition
        #[arg(long, conflicts_with = "json")]
        prometheus: bool,
    },

    /// Show the diagnosis funnel
    Funnel {
        #[arg(long, default_value_t = 30)]
        days: i64,

        #[arg(long)]
        json: bool,
    },

    /// Answer an approval request
    Approve {
        ticket_id: String,
        request_id: String,

        #[arg(long)]
        deny: bool,

        /// Recorded as the approver
        #[arg(long)]
        by: Option<String>,
    },

    /// Check a remote command against the whitelist
    CheckCommand { command: String },

    /// Match a ticket text against the known failure signatures
    Match {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckCommand { command } => {
            if !commands::check_command(&command)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Match { title, description, json } => commands::match_ticket(&title, &description, json),
        Commands::Status => commands::status(&RemedydClient::new(&cli.url)?).await,
        Commands::Metrics { json, prometheus } => {
            commands::metrics(&RemedydClient::new(&cli.url)?, json, prometheus).await
        }
        Commands::Funnel { days, json } => commands::funnel(&RemedydClient::new(&cli.url)?, days, json).await,
        Commands::Approve { ticket_id, request_id, deny, by } => {
            let client = RemedydClient::new(&cli.url)?;
            commands::approve(&client, &ticket_id, &request_id, deny, by.as_deref()).await
        }
    }
}
