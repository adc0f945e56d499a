//! pledgerun CLI - Resumable, checkpointed web form submission.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pledgerun::{
    backfill, BackfillRequest, CdpClient, CdpFormPage, CheckpointStore, Config, RowSource,
    StopReason, SubmissionDriver,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pledgerun")]
#[command(version)]
#[command(about = "Resumable, checkpointed web form submission over the Chrome DevTools Protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit every unprocessed row through the browser
    Run {
        /// Path to input CSV (overrides input.csv)
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Path to checkpoint JSON (overrides checkpoint.path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Mark a range of rows as already submitted, without a browser
    Backfill {
        /// Path to input CSV (overrides input.csv)
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Path to checkpoint JSON (overrides checkpoint.path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Valid rows at the start of the file already accounted for
        #[arg(long)]
        skip: usize,

        /// Serial number for the first appended row
        #[arg(long)]
        start_serial: u64,

        /// Maximum rows to append (default: all remaining; 0 appends nothing)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

const EXAMPLE_CONFIG: &str = r##"# pledgerun configuration file

[input]
# Headerless CSV: column 0 = phone, column 1 = pledge
csv = "rows.csv"

[checkpoint]
path = "processed.json"

[browser]
# Start Chromium with --remote-debugging-port=9222
endpoint = "http://localhost:9222"
navigation_timeout_secs = 45
command_timeout_secs = 30
navigation_attempts = 2

[target]
# Supports ${ENV_VAR}
url = "${PLEDGE_FORM_URL}"
phone_selectors = ["#phone", "input[name='phone']", "input[type='tel']"]
pledge_selectors = ["#pledge", "textarea"]
consent_selectors = ["#terms", "input[type='checkbox']"]
submit_selectors = ["#submitBtn", "button[type='submit']", "input[type='submit']"]
select_selector = "select"
success_endpoint = "action=submit"
success_selectors = ["#pledgeSuccess"]
success_text = "pledge submitted successfully"
challenge_markers = ["captcha", "verify you are human", "i'm not a robot"]
challenge_frame = "recaptcha"

[run]
max_attempts = 2
retry_delay_ms = 3000
backoff = "fixed"  # or "exponential"
confirmation_timeout_secs = 15
poll_interval_ms = 500
min_delay_ms = 2000
max_delay_ms = 4000
max_runtime_secs = 21000  # 5h50m
log_dir = "logs"
capture_diagnostics = true
"##;

fn print_example_config() {
    println!("{EXAMPLE_CONFIG}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!("  Target:   {}", config.target.url);
            info!("  Browser:  {}", config.browser.endpoint);
            info!("  Input:    {:?}", config.input.csv);
            info!("  Store:    {:?}", config.checkpoint.path);
            info!(
                "  Attempts: {} per row, {}s confirmation timeout",
                config.run.max_attempts, config.run.confirmation_timeout_secs
            );
            return Ok(());
        }

        Commands::Run { csv, checkpoint } => {
            let mut config = load_config(&cli.config)?;
            if let Some(csv) = csv {
                config.input.csv = csv;
            }
            if let Some(checkpoint) = checkpoint {
                config.checkpoint.path = checkpoint;
            }
            config.validate().context("Invalid configuration")?;

            let rows = RowSource::load(&config.input.csv)?;
            let mut store = CheckpointStore::open(&config.checkpoint.path);

            let client = CdpClient::connect(
                &config.browser.endpoint,
                Duration::from_secs(config.browser.command_timeout_secs),
            )
            .await
            .context("Failed to connect to browser")?;
            let session = client.new_page().await.context("Failed to open page")?;
            let page = CdpFormPage::new(session, config.target.clone(), &config.browser);

            let mut driver = SubmissionDriver::new(page, config.run.clone()).with_progress();
            let result = driver.run(rows, &mut store).await;

            let page = driver.into_page();
            if let Err(e) = client.close_page(page.target_id()).await {
                warn!(error = %e, "Failed to close page");
            }

            let stats = result?;

            println!("\n=== Submission Run Complete ===");
            println!("Rows:        {}", stats.total_rows);
            println!(
                "Skipped:     {} done, {} incomplete",
                stats.skipped_done, stats.skipped_incomplete
            );
            println!("Submitted:   {}", stats.succeeded);
            println!("Abandoned:   {}", stats.abandoned);
            println!("Attempts:    {}", stats.attempts);
            println!("Store:       {} entries", stats.store_entries);
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Stopped:     {}", stats.stop_reason);

            if stats.stop_reason == StopReason::VerificationChallenge {
                bail!("Run aborted: human verification challenge on the target page");
            }
        }

        Commands::Backfill {
            csv,
            checkpoint,
            skip,
            start_serial,
            limit,
        } => {
            // Backfill needs no target page, so a missing config file is fine.
            let mut config = if cli.config.exists() {
                load_config(&cli.config)?
            } else {
                Config::default()
            };
            if let Some(csv) = csv {
                config.input.csv = csv;
            }
            if let Some(checkpoint) = checkpoint {
                config.checkpoint.path = checkpoint;
            }

            let source = RowSource::open(&config.input.csv)?;
            let mut store = CheckpointStore::open(&config.checkpoint.path);

            let report = backfill(
                &source,
                &mut store,
                BackfillRequest {
                    skip_count: skip,
                    start_serial,
                    limit,
                },
            )?;

            println!("\n=== Backfill Complete ===");
            println!("Loaded:      {} entries", report.loaded_entries);
            println!("Appended:    {}", report.appended);
            println!("Total:       {} entries", report.total_entries);
            println!(
                "Next run:    --skip {} --start-serial {}",
                report.next_skip, report.next_serial
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses_and_validates() {
        std::env::set_var("PLEDGE_FORM_URL", "https://forms.example.org/pledge");
        let config = Config::from_toml(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.target.url, "https://forms.example.org/pledge");
        assert_eq!(config.target.submit_selectors[0], "#submitBtn");
        assert_eq!(config.target.success_selectors, vec!["#pledgeSuccess"]);
        assert_eq!(config.run.max_runtime_secs, 21_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_cli_parses_backfill() {
        let cli = Cli::try_parse_from([
            "pledgerun",
            "backfill",
            "--skip",
            "1267",
            "--start-serial",
            "1268",
            "--limit",
            "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Backfill {
                skip,
                start_serial,
                limit,
                ..
            } => assert_eq!((skip, start_serial, limit), (1267, 1268, Some(0))),
            _ => panic!("expected backfill"),
        }
    }
}
