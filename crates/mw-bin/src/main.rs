//! Millwright entrypoint: batch-mode GRBL program sender.
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use core_config::{EngineConfig, load_from};
use session::{BatchOutcome, Session};
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "millwright", version, about = "GRBL host controller")] // minimal metadata
struct Args {
    /// G-code program to stream. Without it the session connects, prints the
    /// controller banner, and exits.
    pub program: Option<PathBuf>,
    /// Optional configuration file path (overrides discovery of `millwright.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Controller address as host:port, overriding the configured port path.
    #[arg(long = "port")]
    pub port: Option<String>,
    /// Resume the program from its latest valid checkpoint.
    #[arg(long = "resume-from-checkpoint")]
    pub resume: bool,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) -> Result<()> {
        let file_appender = tracing_appender::rolling::never(".", "millwright.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_err) => {
                // Global tracing subscriber already installed; drop guard so writer shuts down.
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!(target: "runtime", error = %e, "fatal");
            eprintln!("millwright: {e:#}");
            BatchOutcome::OperationalFailure.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<BatchOutcome> {
    let mut startup = AppStartup::new();
    startup.configure_logging()?;
    AppStartup::install_panic_hook();
    info!(target: "runtime", "startup");

    let args = Args::parse();
    let config: EngineConfig = load_from(args.config.clone())?;

    let address = args
        .port
        .clone()
        .or_else(|| config.link.port_path.clone())
        .context("no controller address: pass --port or set link.port_path")?;

    info!(target: "runtime.startup", address = %address, "connecting");
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(target: "runtime.startup", address = %address, error = %e, "connect_failed");
            eprintln!("millwright: cannot reach controller at {address}: {e}");
            return Ok(BatchOutcome::LinkFailure);
        }
    };

    let session = Session::attach(stream, config);
    session.bus.emit(core_events::EngineEvent::Connected {
        port: address.clone(),
    });

    match session.await_welcome(Duration::from_secs(3)).await {
        Some(banner) => println!("connected: {banner}"),
        None => println!("connected: {address} (no banner observed)"),
    }
    session.poller.start().await;

    let outcome = match args.program.as_ref() {
        Some(program) => {
            let (result, outcome) = session.stream_program(program, args.resume).await;
            match result {
                Ok(stats) => {
                    println!(
                        "streamed {}/{} lines ({} errored) in {:.1}s",
                        stats.completed,
                        stats.total,
                        stats.errored,
                        stats.elapsed.as_secs_f64()
                    );
                }
                Err(e) => eprintln!("millwright: stream failed: {e}"),
            }
            outcome
        }
        None => BatchOutcome::Success,
    };

    session.shutdown().await;
    info!(target: "runtime", code = outcome.exit_code(), "exit");
    Ok(outcome)
}
