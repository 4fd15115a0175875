use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod shutdown;

use shutdown::StopSignal;

#[derive(Parser)]
#[command(name = "slipstream")]
#[command(about = "Live race telemetry via temporary memory hooks")]
struct Args {
    /// Executable name of the target process.
    #[arg(short, long, env = "SLIPSTREAM_PROCESS")]
    process: Option<String>,

    /// JSON hook table overriding the builtin signatures.
    #[arg(long)]
    hook_table: Option<PathBuf>,

    /// Telemetry poll interval in milliseconds.
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Seconds a deferred-capture patch may stay installed.
    #[arg(long, default_value_t = 10)]
    deferred_window_secs: u64,

    /// Skip thread freezing around patch writes. Faster, but a patch can
    /// race the target's own execution.
    #[arg(long)]
    no_freeze: bool,

    /// Emit snapshots as JSON lines instead of the human-readable form.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("slipstream=info".parse()?))
        .init();

    let args = Args::parse();

    let signal = Arc::new(StopSignal::new());
    let handler_signal = Arc::clone(&signal);
    ctrlc::set_handler(move || {
        handler_signal.trigger();
    })?;

    #[cfg(target_os = "windows")]
    return run(args, &signal);

    #[cfg(not(target_os = "windows"))]
    {
        let _ = (args, signal);
        anyhow::bail!("slipstream instruments a live Windows target; no attach backend on this platform");
    }
}

#[cfg(target_os = "windows")]
fn run(args: Args, signal: &StopSignal) -> Result<()> {
    use std::time::Duration;

    use slipstream_core::telemetry::WindowsProvider;
    use slipstream_core::{EngineConfig, Reading, TelemetryReader};
    use tracing::{error, info};

    let mut builder = EngineConfig::builder()
        .poll_interval(Duration::from_millis(args.poll_ms))
        .deferred_exposure_window(Duration::from_secs(args.deferred_window_secs))
        .freeze_for_capture(!args.no_freeze);
    if let Some(process) = args.process {
        builder = builder.process_name(process);
    }
    if let Some(path) = args.hook_table {
        builder = builder.hook_table_path(path);
    }
    let config = builder.build();
    let poll_interval = config.poll_interval;
    let process_name = config.process_name.clone();

    let mut reader = TelemetryReader::new(WindowsProvider, config)?;
    info!("slipstream starting, watching for {process_name}");

    while !signal.is_stopped() {
        match reader.poll() {
            Ok(Reading::Snapshot(snapshot)) => {
                if args.json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    print_snapshot(&snapshot);
                }
                signal.wait(poll_interval);
            }
            Ok(Reading::Unchanged) => {
                signal.wait(poll_interval);
            }
            Err(e) if e.is_fatal() => {
                error!("fatal: {e}");
                break;
            }
            Err(e) => {
                info!("waiting for {process_name}: {e}");
                signal.wait(Duration::from_secs(2));
            }
        }
    }

    info!("shutting down, removing instrumentation");
    reader.shutdown();
    Ok(())
}

#[cfg(target_os = "windows")]
fn print_snapshot(snapshot: &slipstream_core::TelemetrySnapshot) {
    let timer = match snapshot.timer_us {
        Some(us) => format!("{:>9.3}s", us as f64 / 1_000_000.0),
        None => "      ---".to_string(),
    };
    let progress = snapshot
        .progress
        .map(|p| format!("{:5.1}%", p * 100.0))
        .unwrap_or_else(|| "  ---".to_string());
    let gear = snapshot
        .gear
        .map(|g| g.to_string())
        .unwrap_or_else(|| "-".to_string());
    let speed = snapshot
        .velocity
        .map(|v| format!("{:6.1}", v.speed()))
        .unwrap_or_else(|| "   ---".to_string());
    println!(
        "t={timer} prog={progress} rpm={:>5} gear={gear} v={speed} state={}",
        snapshot.rpm, snapshot.race_state
    );
}
