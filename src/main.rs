use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use corral::cli::{Cli, Command};
use corral::config::{self, Config};
use corral::connection::TracingHost;
use corral::error::CorralError;
use corral::inventory::InventoryReader;
use corral::lifecycle;
use corral::reconciler::Reconciler;
use corral::runner::{LogSink, MachineTool, RunOptions};
use corral::status::{Provider, machine_status};
use corral::util;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("corral=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = config::load_config(&cli.config)?;
    let runner = Arc::new(MachineTool::new(&config.binary));

    match cli.command {
        Command::List => run_list(runner).await?,
        Command::Init {
            name,
            cpus,
            memory,
            disk_size,
        } => {
            let opts =
                lifecycle::resolve_create_options(&config.defaults, name, cpus, memory, disk_size)?;
            lifecycle::create_machine(runner.as_ref(), &opts, run_options()).await?;
            println!(
                "Machine {} created.",
                style(opts.name.as_deref().unwrap_or("(default)")).green()
            );
        }
        Command::Start { name } => {
            let provider = Provider::platform_default();
            lifecycle::start_machine(runner.as_ref(), &name, &provider, run_options()).await?;
            println!("Machine {} started.", style(&name).green());
        }
        Command::Stop { name } => {
            let provider = Provider::platform_default();
            lifecycle::stop_machine(runner.as_ref(), &name, &provider, run_options()).await?;
            println!("Machine {} stopped.", style(&name).yellow());
        }
        Command::Rm { name } => {
            lifecycle::delete_machine(runner.as_ref(), &name, run_options()).await?;
            println!("Machine {} removed.", style(&name).red());
        }
        Command::Watch => run_watch(runner, &config).await?,
    }

    Ok(())
}

// ── list ─────────────────────────────────────────────────

async fn run_list(runner: Arc<MachineTool>) -> Result<(), CorralError> {
    let reader = InventoryReader::new(runner);
    let (records, soft_error) = reader.read().await;

    // The reader degrades instead of raising, but a human asked for the
    // data: zero records plus an error is worth failing loudly over.
    if let Some(cause) = soft_error
        && records.is_empty()
    {
        return Err(CorralError::Validation {
            message: format!("could not read machine list: {cause}"),
        });
    }

    if records.is_empty() {
        println!("No machines.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:>5} {:>10} {:>10} {:>7}",
        style("NAME").bold(),
        style("STATUS").bold(),
        style("CPUS").bold(),
        style("MEMORY").bold(),
        style("DISK").bold(),
        style("PORT").bold(),
    );
    for record in &records {
        let status = machine_status(record.running, record.starting);
        println!(
            "{:<20} {:<10} {:>5} {:>10} {:>10} {:>7}",
            record.identity,
            status,
            record.cpus,
            util::format_size(record.memory_bytes),
            util::format_size(record.disk_bytes),
            record.port,
        );
    }
    Ok(())
}

/// Options for a user-driven lifecycle command: the tool's own output is
/// echoed to the terminal, dimmed, as it is captured.
fn run_options() -> RunOptions {
    let sink: LogSink = Arc::new(|line: &str| eprintln!("{}", style(line).dim()));
    RunOptions::default().with_logger(sink)
}

// ── watch ────────────────────────────────────────────────

async fn run_watch(runner: Arc<MachineTool>, config: &Config) -> Result<(), CorralError> {
    let host = Arc::new(TracingHost);
    let reconciler = Reconciler::new(
        runner,
        host,
        Provider::platform_default(),
        Duration::from_millis(config.poll_interval_ms),
    );

    let _sub = reconciler.subscribe(|identity, status| {
        tracing::info!(identity, %status, "status change");
    });

    let stop = CancellationToken::new();
    let canceller = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            canceller.cancel();
        }
    });

    reconciler.run(stop).await;
    Ok(())
}
