//! fedi-send - Send one authenticated request to a Fediverse instance
//!
//! The request is journaled before it goes out, so an outage or an expired
//! sign-in never loses it: `fedi-journal replay` (or the next `fedi-send`) picks
//! it up again.

use clap::Parser;
use libfedisend::{
    Config, Fedisend, FedisendError, FormPart, MethodName, ReplayReport, RequestConfig, Result,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fedi-send")]
#[command(version)]
#[command(about = "Send one authenticated request to a Fediverse instance")]
#[command(long_about = "\
fedi-send - Send one authenticated request to a Fediverse instance

DESCRIPTION:
    fedi-send performs a single GET, POST or DELETE against the configured
    instance and prints the response body to stdout. Requests are journaled
    before they are sent; anything left over from earlier runs is replayed
    first.

    When that replay stops on a mutation, a new POST or DELETE is queued
    behind it instead of overtaking it, and goes out with the next replay.
    Use --force to send it right away regardless.

    Signing in happens on demand: when no access token is stored, fedi-send
    prints an authorization URL and asks for the code the instance shows.

USAGE EXAMPLES:
    # Read the home timeline
    fedi-send get /api/v1/timelines/home -p limit=5

    # Post a status
    fedi-send post /api/v1/statuses -p status=\"Hello, fediverse\"

    # Upload media with a description
    fedi-send post /api/v2/media -F file=@cat.png -F description=\"A cat\"

    # Delete a status without replaying the journal first
    fedi-send delete /api/v1/statuses/109 --no-resume

    # Send even if older journaled mutations are still stuck
    fedi-send post /api/v1/statuses/109/unreblog --force

CONFIGURATION:
    Configuration file: ~/.config/fedisend/config.toml

    Override with environment variables:
        FEDISEND_CONFIG           - Path to config file
        FEDISEND_JOURNAL_PATH     - Path to journal database
        FEDISEND_MASTER_PASSWORD  - Master password for encrypted credentials

EXIT CODES:
    0 - Success
    1 - Request failed (it stays journaled if it was a mutation)
    2 - Authentication failed
    3 - Invalid input
")]
struct Cli {
    /// HTTP method: get, post or delete
    method: String,

    /// Route on the instance, e.g. /api/v1/statuses
    route: String,

    /// Parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Header as name:value (repeatable)
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Multipart field as name=value, or name=@path for a file (repeatable)
    #[arg(short = 'F', long = "form", value_name = "NAME=VALUE")]
    form: Vec<String>,

    /// Do not replay journaled requests first
    #[arg(long)]
    no_resume: bool,

    /// Send a mutation even when journaled ones could not be replayed
    #[arg(long)]
    force: bool,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
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
    let method = parse_method(&cli.method)?;
    let config = build_request_config(&cli.params, &cli.headers, &cli.form)?;

    let fedisend = Fedisend::open(Config::load()?).await?;

    let report = if cli.no_resume {
        None
    } else {
        Some(fedisend.resume().await?)
    };

    if let Some(mut report) = report.filter(|report| !report.is_complete()) {
        match next_step(&report, method, cli.force) {
            NextStep::Queue => {
                let request = fedisend.enqueue(method, &cli.route, config).await?;
                eprintln!(
                    "Queued request {} behind {} journaled request(s)",
                    request.id(),
                    report.retained
                );
                return match report.halted_by.take() {
                    Some(cause) => Err(cause.into()),
                    None => Ok(()),
                };
            }
            NextStep::Send if method.is_read_only() => info!(
                "{} journaled request(s) still pending; reads do not wait for them",
                report.retained
            ),
            NextStep::Send => warn!(
                "Sending ahead of {} journaled request(s) as requested",
                report.retained
            ),
        }
    }

    let response = fedisend.call(method, &cli.route, config).await?;
    println!("{}", response.body);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Send,
    Queue,
}

/// A mutation must not overtake older ones that replay left behind
fn next_step(report: &ReplayReport, method: MethodName, force: bool) -> NextStep {
    if report.is_complete() || method.is_read_only() || force {
        NextStep::Send
    } else {
        NextStep::Queue
    }
}

fn parse_method(method: &str) -> Result<MethodName> {
    method.to_uppercase().parse().map_err(|_| {
        FedisendError::InvalidInput(format!(
            "Invalid method '{}'. Must be get, post or delete",
            method
        ))
    })
}

fn split_pair<'a>(pair: &'a str, separator: char, expected: &str) -> Result<(&'a str, &'a str)> {
    match pair.split_once(separator) {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(FedisendError::InvalidInput(format!(
            "Invalid argument '{}'. Expected {}",
            pair, expected
        ))),
    }
}

fn build_request_config(params: &[String], headers: &[String], form: &[String]) -> Result<RequestConfig> {
    let mut config = RequestConfig::new();

    for param in params {
        let (key, value) = split_pair(param, '=', "KEY=VALUE")?;
        config = config.parameter(key, value);
    }

    for header in headers {
        let (name, value) = split_pair(header, ':', "NAME:VALUE")?;
        config = config.header(name, value.trim());
    }

    for field in form {
        let (name, value) = split_pair(field, '=', "NAME=VALUE or NAME=@PATH")?;
        let part = match value.strip_prefix('@') {
            Some(path) => FormPart::file(name, shellexpand::tilde(path).to_string()),
            None => FormPart::field(name, value),
        };
        config = config.part(part);
    }

    Ok(config)
}
