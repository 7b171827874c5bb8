//! fedi-journal - Inspect, cancel and replay journaled requests
//!
//! Unix-style tool over the fedisend request journal.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use libfedisend::client::open_journal;
use libfedisend::error::JournalError;
use libfedisend::request::form::spooled_digests;
use libfedisend::request::AttachmentPolicy;
use libfedisend::{Config, Fedisend, FedisendError, Journal, JournalRecord, ReplayReport, Result};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fedi-journal")]
#[command(version)]
#[command(about = "Inspect, cancel and replay journaled requests")]
#[command(long_about = "\
fedi-journal - Inspect, cancel and replay journaled requests

DESCRIPTION:
    Every request sent by fedisend is written to a journal before it goes out
    and removed once the instance has answered it. Requests left behind by a
    crash, an outage or an expired sign-in stay there until they are replayed
    or cancelled.

COMMANDS:
    list        List journaled requests, oldest first
    cancel      Remove journaled requests
    replay      Send journaled requests again, in order

USAGE EXAMPLES:
    # List journaled requests
    fedi-journal list

    # List in JSON format
    fedi-journal list --format json

    # Drop one request
    fedi-journal cancel <ID>

    # Drop everything
    fedi-journal cancel --all --force

    # Drain the journal every 30 seconds until interrupted
    fedi-journal replay --watch --interval 30s

CONFIGURATION:
    Configuration file: ~/.config/fedisend/config.toml
    Journal location:   ~/.local/share/fedisend/journal.db

    Override with environment variables:
        FEDISEND_CONFIG        - Path to config file
        FEDISEND_JOURNAL_PATH  - Path to journal database

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authentication failed
    3 - Invalid input (unknown request ID, bad format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List journaled requests
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove journaled requests without sending them
    Cancel {
        /// Request ID to remove
        id: Option<String>,

        /// Remove every journaled request
        #[arg(long, conflicts_with = "id")]
        all: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Send journaled requests again, oldest first
    Replay {
        /// Keep draining the journal until interrupted
        #[arg(long)]
        watch: bool,

        /// Pause between passes in watch mode (e.g. "30s", "5m")
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libfedisend::logging::LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::List { format } => {
            let format = OutputFormat::parse(&format)?;
            let config = Config::load()?;
            let journal = open_journal(&config).await?;
            cmd_list(&journal, format).await
        }
        Commands::Cancel { id, all, force } => {
            let config = Config::load()?;
            let journal = open_journal(&config).await?;
            let attachments = config.attachments.policy();
            cmd_cancel(&journal, &attachments, id.as_deref(), all, force).await
        }
        Commands::Replay {
            watch,
            interval,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let fedisend = Fedisend::open(Config::load()?).await?;
            if watch {
                cmd_watch(&fedisend, interval).await
            } else {
                let report = fedisend.resume().await?;
                print_report(&report, format)?;
                match report.halted_by {
                    Some(cause) => Err(cause.into()),
                    None => Ok(()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(FedisendError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                format
            ))),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| JournalError::Encoding(format!("JSON output: {}", e)).into())
}

/// List journaled requests
async fn cmd_list(journal: &dyn Journal, format: OutputFormat) -> Result<()> {
    let records = journal.records().await?;

    match format {
        OutputFormat::Json => println!("{}", to_json(&records)?),
        OutputFormat::Text => {
            for record in &records {
                println!("{}", format_record(record));
            }
        }
    }

    Ok(())
}

fn format_record(record: &JournalRecord) -> String {
    let created = chrono::DateTime::from_timestamp_millis(record.timestamp)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());

    format!(
        "{} | {} {} | {}",
        record.id, record.method_name, record.route, created
    )
}

/// Remove journaled request(s) along with the spooled attachments only they used
async fn cmd_cancel(
    journal: &dyn Journal,
    attachments: &AttachmentPolicy,
    id: Option<&str>,
    all: bool,
    force: bool,
) -> Result<()> {
    let records = journal.records().await?;

    if all {
        if records.is_empty() {
            println!("Journal is empty");
            return Ok(());
        }

        if !force && !confirm(&format!("Remove {} journaled request(s)?", records.len()))? {
            println!("Aborted");
            return Ok(());
        }

        let removed = journal.clear().await?;
        let released = records
            .iter()
            .flat_map(|record| spooled_digests(&record.form))
            .collect();
        release_spooled(journal, attachments, &released).await?;
        println!("Cancelled {} request(s)", removed);
        return Ok(());
    }

    let id = id.ok_or_else(|| {
        FedisendError::InvalidInput("Specify a request ID or --all".to_string())
    })?;

    if journal.remove(id).await? {
        let released = records
            .iter()
            .find(|record| record.id == id)
            .map(|record| spooled_digests(&record.form))
            .unwrap_or_default();
        release_spooled(journal, attachments, &released).await?;
        println!("Cancelled request {}", id);
        Ok(())
    } else {
        Err(FedisendError::InvalidInput(format!(
            "No journaled request with ID {}",
            id
        )))
    }
}

/// Delete spool files that no remaining entry refers to
async fn release_spooled(
    journal: &dyn Journal,
    attachments: &AttachmentPolicy,
    released: &HashSet<String>,
) -> Result<()> {
    if released.is_empty() {
        return Ok(());
    }

    let retained = journal.spooled_references().await?;
    let removed = attachments.release(released, &retained).await;
    info!("Released {} spooled attachment(s)", removed);
    Ok(())
}

/// Ask for confirmation on an interactive terminal; refuse otherwise
fn confirm(question: &str) -> Result<bool> {
    if !atty::is(atty::Stream::Stdin) {
        return Err(FedisendError::InvalidInput(
            "Refusing to cancel everything without --force on a non-interactive terminal"
                .to_string(),
        ));
    }

    print!("{} [y/N] ", question);
    io::stdout()
        .flush()
        .map_err(JournalError::IoError)?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .map_err(JournalError::IoError)?;

    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_report(report: &ReplayReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", to_json(report)?),
        OutputFormat::Text => {
            println!(
                "Replayed {}, discarded {}, rejected {}, retained {}",
                report.replayed, report.discarded, report.rejected, report.retained
            );
            if let Some(id) = &report.halted_at {
                println!("Halted at {}", id);
            }
        }
    }
    Ok(())
}

/// Drain the journal repeatedly until SIGINT or SIGTERM
async fn cmd_watch(fedisend: &Fedisend, interval: Duration) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    info!("Watching the journal every {}", humantime::format_duration(interval));

    while !shutdown.load(Ordering::Relaxed) {
        match fedisend.resume().await {
            Ok(report) if report.replayed + report.rejected + report.discarded > 0 => {
                info!(
                    "Replayed {}, discarded {}, rejected {}, retained {}",
                    report.replayed, report.discarded, report.rejected, report.retained
                );
            }
            Ok(_) => {}
            // A malformed record needs an operator; retrying will not help
            Err(e @ FedisendError::Journal(JournalError::UnknownMethod { .. })) => return Err(e),
            Err(e) => error!("Replay failed: {}", e),
        }

        // Sleep until the next pass, checking for shutdown every 100ms
        let deadline = tokio::time::Instant::now() + interval;
        while !shutdown.load(Ordering::Relaxed) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let interrupted = fedisend.requester().interrupt();
    info!("Stopped watching ({} in-flight request(s) interrupted)", interrupted);
    Ok(())
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| FedisendError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::parse("json").unwrap(), OutputFormat::Json);
        assert!(matches!(
            OutputFormat::parse("yaml"),
            Err(FedisendError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_format_record() {
        let record = JournalRecord {
            id: "abc".to_string(),
            method_name: "POST".to_string(),
            route: "/api/v1/statuses".to_string(),
            headers: "{}".to_string(),
            parameters: "{}".to_string(),
            form: "[]".to_string(),
            timestamp: 1_700_000_000_000,
        };

        assert_eq!(
            format_record(&record),
            "abc | POST /api/v1/statuses | 2023-11-14 22:13:20 UTC"
        );
    }
}
