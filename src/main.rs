mod actions;
mod analytics;
mod clients;
mod config;
mod cursor;
mod detector;
mod events;
mod history;
mod integrations;
mod models;
mod outbox;
mod runtime;
mod storage;
mod tenant;
#[cfg(test)]
mod test_support;
mod tracker;

use crate::analytics::LeadFilter;
use crate::config::{Config, config_path};
use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "leadsync", version, about = "Lead label history sync")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "LEADSYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configured clients
    Clients {
        #[command(subcommand)]
        command: ClientCommands,
    },
    /// Import a client's leads sheet once
    Import {
        #[arg(long)]
        client: String,
        /// Spreadsheet URL or id to store for the client first
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Run one sync pass
    Sync {
        #[arg(long)]
        client: String,
    },
    /// Poll in the foreground and print label changes
    Watch {
        #[arg(long)]
        client: String,
        /// Seconds between passes
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Record a manual label change
    Track {
        #[arg(long)]
        client: String,
        /// Lead id or exact name
        lead: String,
        label: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Show a lead's label history
    History {
        #[arg(long)]
        client: String,
        lead: String,
        /// Merge the remote history sheet first
        #[arg(long)]
        refresh: bool,
    },
    /// Remove duplicate history entries
    Dedupe {
        #[arg(long)]
        client: String,
        /// Only this lead (id or exact name)
        lead: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Dashboard numbers for a client's leads
    Stats {
        #[arg(long)]
        client: String,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, value_parser = actions::parse_date_arg)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = actions::parse_date_arg)]
        to: Option<NaiveDate>,
    },
    /// Leads grouped by label
    Kanban {
        #[arg(long)]
        client: String,
    },
    /// Sync and delivery state for a client
    Status {
        #[arg(long)]
        client: String,
    },
}

#[derive(Subcommand, Debug)]
enum ClientCommands {
    List,
    /// Import clients from a published configuration sheet
    Import { url: String },
    /// Add a client
    Add {
        name: String,
        /// Leads spreadsheet URL or id
        #[arg(long)]
        sheet: Option<String>,
        /// Separate history spreadsheet URL or id
        #[arg(long)]
        history_sheet: Option<String>,
        /// Web app that appends history rows
        #[arg(long)]
        webapp_url: Option<String>,
        /// Conversion labels, comma separated
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
    },
    /// Remove a client and its stored leads and history
    Remove {
        /// Client id or name
        client: String,
        /// Keep the client's stored data
        #[arg(long)]
        keep_data: bool,
    },
    /// Write the client list back to the configuration sheet
    Export {
        /// Configuration sheet URL or id (defaults to the imported one)
        #[arg(long)]
        sheet: Option<String>,
        /// Web app endpoint (defaults to the configured one)
        #[arg(long)]
        endpoint: Option<String>,
    },
}

fn init_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LEADSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let path = cli.config.unwrap_or_else(config_path);

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_logging(level);

    match cli.command {
        Commands::Clients { command } => match command {
            ClientCommands::List => {
                actions::list_clients(&config, &path);
                Ok(())
            }
            ClientCommands::Import { url } => actions::import_clients(&mut config, &path, &url),
            ClientCommands::Add {
                name,
                sheet,
                history_sheet,
                webapp_url,
                labels,
            } => {
                let fields = actions::NewClient {
                    sheet,
                    history_sheet,
                    webapp_url,
                    labels,
                };
                actions::add_client(&mut config, &path, &name, fields)
            }
            ClientCommands::Remove { client, keep_data } => {
                actions::remove_client(&mut config, &path, &client, keep_data)
            }
            ClientCommands::Export { sheet, endpoint } => {
                actions::export_clients(&config, sheet.as_deref(), endpoint.as_deref())
            }
        },
        Commands::Import { client, sheet } => {
            actions::import_leads(&mut config, &path, &client, sheet.as_deref())
        }
        Commands::Sync { client } => actions::sync(&config, &client),
        Commands::Watch {
            client,
            interval_secs,
        } => actions::watch(&config, &client, interval_secs),
        Commands::Track {
            client,
            lead,
            label,
            reason,
            actor,
        } => actions::track(&config, &client, &lead, &label, reason, actor),
        Commands::History {
            client,
            lead,
            refresh,
        } => actions::history(&config, &client, &lead, refresh),
        Commands::Dedupe {
            client,
            lead,
            dry_run,
        } => actions::dedupe(&config, &client, lead.as_deref(), dry_run),
        Commands::Stats {
            client,
            search,
            label,
            source,
            from,
            to,
        } => {
            let filter = LeadFilter {
                search,
                label,
                source,
                start: from,
                end: to,
            };
            actions::stats(&config, &client, &filter)
        }
        Commands::Kanban { client } => actions::kanban(&config, &client),
        Commands::Status { client } => actions::status(&config, &client),
    }
}
