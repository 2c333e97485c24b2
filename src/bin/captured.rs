//! captured - camera capture daemon
//!
//! This daemon:
//! 1. Loads configuration (optional JSON file + environment)
//! 2. Creates the output directory
//! 3. Captures one window of frames from the configured RTSP stream
//! 4. Uploads the captured artifacts over MQTT
//! 5. Waits for Ctrl-C / host shutdown

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use capture_module::{
    CancelReason, CancellationSignal, CaptureConfig, MqttUploadClient, Orchestrator, RtspClient,
    RtspClientConfig, RunReport, UploadConnection,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture an RTSP window and upload the frames")]
struct Args {
    /// Path to a JSON config file. Environment variables override it.
    #[arg(long, env = "CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Exit after the upload stage instead of waiting for shutdown.
    #[arg(long)]
    no_wait: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = CancellationSignal::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        if handler_signal.cancel(CancelReason::Shutdown) {
            log::info!("shutdown signal received");
        }
    })
    .expect("error setting Ctrl-C handler");

    if let Err(e) = run(&args, &shutdown) {
        log::error!("capture run failed: {:#}", e);
    }

    if !args.no_wait {
        log::info!("captured waiting for shutdown signal (Ctrl-C)...");
        shutdown.wait();
    }
    log::info!("captured stopped");
    Ok(())
}

fn run(args: &Args, shutdown: &CancellationSignal) -> Result<()> {
    let config = CaptureConfig::load_from(args.config.as_deref())?;
    log::info!(
        "captured {} starting: device={}, stream={}, output={}",
        env!("CARGO_PKG_VERSION"),
        config.device_id,
        config.stream_url,
        config.output_dir.display()
    );

    if !config.capture_enabled {
        log::info!("no video capture by configuration");
        return Ok(());
    }

    log::info!("creating storage folder {}", config.output_dir.display());
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("create {}", config.output_dir.display()))?;

    let connection_string = config
        .upload_connection_string
        .as_deref()
        .ok_or_else(|| anyhow!("EDGE_CONN_STR must be set when capture is enabled"))?;
    let upload_connection = UploadConnection::parse(connection_string, &config.device_id)?;
    let uploader = MqttUploadClient::new(upload_connection);

    let client = RtspClient::new(&config.stream_uri()?, RtspClientConfig::default())?;
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.run(client, uploader, shutdown)?;

    match &report {
        RunReport::Disabled => {}
        RunReport::Completed { window, uploads } => {
            log::info!(
                "window {:?}: {} frames written in {:?}",
                window.outcome,
                window.frames_written,
                window.elapsed
            );
            if uploads.is_some() {
                log::info!(
                    "uploads: {} succeeded, {} failed",
                    report.uploads_succeeded(),
                    report.uploads_failed()
                );
            }
        }
    }
    Ok(())
}
