// Ambeelight - ambient screen color sync for Yeelight bulbs
// Terminal control panel by default, --headless streams straight away
use anyhow::{bail, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ambeelight::{watcher, AppConfig, Args, ScreenCapture, SessionController, StatusEvent};

mod tui;

fn init_logging(args: &Args, config_path: &Path) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ambeelight=info"));

    // The TUI owns the terminal, so logs go to a file unless running headless
    match (&args.log_file, args.headless) {
        (None, true) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        (log_file, _) => {
            let path = log_file
                .clone()
                .unwrap_or_else(|| config_path.with_file_name("ambeelight.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
    }
    Ok(())
}

fn run_headless(
    mut config: AppConfig,
    mut controller: SessionController,
    events: Receiver<StatusEvent>,
) -> Result<()> {
    let endpoint = config.endpoint()?;
    controller.start(endpoint, config.session_config())?;
    println!("🔌 Connecting to {}...", config.device_ip);

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))?;

    let mut stop_sent = false;
    let outcome = loop {
        if !running.load(Ordering::SeqCst) && !stop_sent {
            controller.stop();
            stop_sent = true;
        }

        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(StatusEvent::Connected) => {
                println!("✅ Streaming to {} (Ctrl+C to stop)", config.device_ip);
                let live = controller.settings().snapshot();
                config.brightness = live.brightness;
                config.interval_ms = live.interval.as_millis() as u64;
                if let Err(e) = config.save() {
                    eprintln!("⚠️  Could not save config: {}", e);
                }
            }
            Ok(StatusEvent::Disconnected) => break Ok(()),
            Ok(StatusEvent::Error(reason)) => break Err(reason),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    controller.shutdown();
    let stats = controller.stats();
    println!(
        "\n👋 Stopped after {} ticks ({} colors sent, {} captures skipped)",
        stats.ticks, stats.frames_sent, stats.captures_skipped
    );

    if let Err(reason) = outcome {
        bail!(reason);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = AppConfig::config_path(args.cfg.as_deref())?;
    let config_file_exists = config_path.exists();

    let mut config = match AppConfig::load_or_default(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("\n❌ Failed to load config file: {}", e);
            eprintln!("Config file: {}", config_path.display());
            eprintln!("\nPlease fix the config file or delete it to regenerate with defaults.");
            return Err(e);
        }
    };

    let args_provided = config.merge_with_args(&args);
    if !config_file_exists || args_provided {
        config.save()?;
    }

    init_logging(&args, &config_path)?;
    tracing::info!(config = %config_path.display(), "starting");

    let (controller, events) = SessionController::new(Arc::new(ScreenCapture), config.timeouts());

    // Brightness/interval edits in the config file apply to a running session
    let _watcher = match watcher::watch_config(&config_path, controller.settings()) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("could not watch config file for changes: {}", e);
            None
        }
    };

    if args.headless {
        run_headless(config, controller, events)
    } else {
        tui::run_control_panel(config, controller, events)
    }
}
