//! Shipwright deployment orchestrator.

use std::collections::HashMap;
use std::env;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use secrecy::SecretString;
use tracing::{error, info};

use shipwright::app::options::AppOptions;
use shipwright::app::run::run;
use shipwright::logs::{init_logging, LogOptions};
use shipwright::storage::layout::StorageLayout;
use shipwright::storage::settings::Settings;
use shipwright::utils::version_info;
use shipwright::vault::{generate_key, Vault};

#[tokio::main]
async fn main() {
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

    if let Err(e) = dispatch(&cli_args).await {
        eprintln!("shipwright: {:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli_args: &HashMap<String, String>) -> anyhow::Result<()> {
    // Print version and exit
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version_info())?);
        return Ok(());
    }

    if cli_args.contains_key("gen-key") {
        println!("{}", generate_key());
        return Ok(());
    }

    let layout = match cli_args.get("data-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };
    let settings_file = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.settings_file());
    let settings = Settings::load(&settings_file)
        .await
        .with_context(|| format!("unable to read settings file {}", settings_file.display()))?;

    if cli_args.contains_key("encrypt") {
        return encrypt_stdin(&settings);
    }

    serve(settings, layout).await
}

/// Read a secret from stdin and print its vault blob
fn encrypt_stdin(settings: &Settings) -> anyhow::Result<()> {
    let vault = Vault::from_key_material(settings.resolved_encryption_key().as_deref())
        .context("an encryption key is required to encrypt secrets")?;
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let secret = SecretString::from(input.trim_end_matches(['\r', '\n']).to_string());
    println!("{}", vault.encrypt(&secret)?);
    Ok(())
}

async fn serve(settings: Settings, layout: StorageLayout) -> anyhow::Result<()> {
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings.log_to_file.then(|| layout.logs_dir()),
        ..Default::default()
    };
    // held until exit so buffered file logs are flushed
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings, layout);

    info!("Running Shipwright {} with options: {:?}", version_info().version, options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = &result {
        error!("Failed to run the orchestrator: {e}");
    }
    Ok(result?)
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    error!("Unable to install signal handlers, falling back to Ctrl+C");
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
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
