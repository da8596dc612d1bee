//! deployd - Entry Point

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::app::state::Collaborators;
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::settings::{Settings, DEFAULT_SETTINGS_PATH};
use deployd::utils::version_info;

use tracing::{error, info};

fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render version: {}", e),
        }
        return;
    }

    // Retrieve the settings file
    let settings_path = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let settings = match Settings::load_blocking(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            std::process::exit(2);
        }
    };

    // Initialize logging; the guard flushes file output on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    // Single cooperative loop; pipeline stages use the bounded blocking pool
    let worker_threads = settings.worker_threads.max(1);
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(worker_threads)
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let options = AppOptions::from_settings(settings);
    let collaborators = Collaborators::system(&options);

    info!(
        "Running deployd {} ({} pipeline workers) with options: {:?}",
        version.version, worker_threads, options
    );
    let result = runtime.block_on(run(options, collaborators, await_shutdown_signal()));
    if let Err(e) = result {
        error!("Failed to run deployd: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            error!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down...");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down...");
        }
    }
}
