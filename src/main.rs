//! bdevperf CLI entry point

use anyhow::Context;
use bdevperf::bdev::malloc::{MallocBdev, MallocOptions};
use bdevperf::bdev::BdevRegistry;
use bdevperf::config::cli::Cli;
use bdevperf::config::toml::load_config;
use bdevperf::config::validator::validate_config;
use bdevperf::config::{Config, DeviceConfig};
use bdevperf::coordinator::{ControlHandle, Controller};
use bdevperf::output::json::control_reply;
use bdevperf::output::OutputFormat;
use bdevperf::worker::affinity::parse_core_list;
use bdevperf::worker::reactor::ReactorPool;
use bdevperf::{FailureCode, Result};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(FailureCode::invalid().exit_status())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn malloc_device(device: &DeviceConfig) -> MallocBdev {
    let mut options = MallocOptions::new(&device.name, device.num_blocks(), device.block_size);
    if device.md_size > 0 {
        options = options.with_metadata(device.md_size, device.md_interleaved);
    }
    MallocBdev::new(options)
}

fn build_registry(config: &Config) -> BdevRegistry {
    let mut registry = BdevRegistry::new();
    for device in &config.devices {
        debug!(device = %device.name, blocks = device.num_blocks(), "creating malloc device");
        registry.register(Arc::new(malloc_device(device)));
    }
    registry
}

/// Answer `perform_tests` lines on stdin until it closes
async fn serve_control_requests(handle: ControlHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "" => {}
                "perform_tests" => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let reply = handle.perform_tests().await;
                        println!("{}", control_reply(&reply));
                    });
                }
                other => {
                    warn!(request = other, "unknown control request");
                    println!(
                        "{}",
                        json!({ "error": { "code": FailureCode::invalid().0, "message": "Method not found" } })
                    );
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!("control input failed: {}", err);
                break;
            }
        }
    }
    handle.shutdown();
}

fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;
    let run_config = match validate_config(&config) {
        Ok(run_config) => run_config,
        Err(err) => {
            error!("{}", err);
            return Ok(err.code().exit_status());
        }
    };

    let registry = build_registry(&config);
    let cores = parse_core_list(config.runtime.cores.as_deref().unwrap_or("0"))?;
    let reactors = ReactorPool::new(&cores, config.runtime.pin_cores)?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let wait_for_tests = run_config.wait_for_tests;
    let (controller, handle) = Controller::new(run_config, registry, reactors.handles(), format)?;
    let controller_context = reactors.handle(0).context("no execution context")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the main runtime")?;
    let outcome = runtime.block_on(async {
        let task = controller_context.spawn(controller.run());

        let on_signal = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.shutdown();
            }
        });
        if wait_for_tests {
            tokio::spawn(serve_control_requests(handle.clone()));
        }

        task.await.context("controller task failed")
    });
    // A pending stdin read must not hold up the exit.
    runtime.shutdown_background();
    let outcome = outcome?;

    drop(reactors);
    Ok(outcome.exit_status())
}
