//! Vigil headless host.
//!
//! Wires the core engine to a SQLite history, the settings file, an optional
//! HTTP forwarder and a stdin control console. Exits on `quit` or Ctrl-C.

mod commands;
mod forwarder;
mod settings;
mod state;
mod storage;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use state::AppState;
use storage::SqliteStore;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vigil_core::capture::{MicrophoneConfig, MicrophoneSource, SyntheticSource};
use vigil_core::{CaptureSources, ClassifierHandle, RuleClassifier, VigilEngine};

use crate::commands::Command;
use crate::forwarder::Forwarder;
use crate::settings::{AudioSourceKind, ClassifierKind};

fn parse_settings_arg() -> anyhow::Result<Option<PathBuf>> {
    let mut it = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let value = it.next().context("missing value for --settings")?;
                path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!("Usage: vigil [--settings <settings.json>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(path)
}

fn build_sources(settings: &AppSettings) -> CaptureSources {
    let synthetic = Arc::new(SyntheticSource::new(settings.synthetic.clone()));
    match settings.audio_source {
        AudioSourceKind::Synthetic => CaptureSources::shared(synthetic),
        AudioSourceKind::Microphone => {
            let microphone = MicrophoneSource::new(MicrophoneConfig {
                device: settings.preferred_input_device.clone(),
                preference: settings.device_preference,
                sample_rate: settings.engine.features.audio_sample_rate,
                ..MicrophoneConfig::default()
            });
            CaptureSources {
                audio: Arc::new(microphone),
                video: synthetic,
            }
        }
    }
}

fn build_classifier(settings: &AppSettings) -> ClassifierHandle {
    match (settings.classifier, settings.classifier_url.as_ref()) {
        (ClassifierKind::Remote, Some(url)) => {
            use vigil_core::{RemoteClassifier, RemoteClassifierConfig};
            info!(endpoint = %url, "using remote classifier");
            ClassifierHandle::new(RemoteClassifier::new(RemoteClassifierConfig {
                endpoint: url.clone(),
                bearer_token: settings.classifier_token.clone(),
            }))
        }
        _ => ClassifierHandle::new(RuleClassifier::default()),
    }
}

fn spawn_status_logger(engine: &VigilEngine) {
    let mut status_rx = engine.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match event.detail {
                    Some(detail) => warn!(status = ?event.status, "engine status: {detail}"),
                    None => info!(status = ?event.status, "engine status changed"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut activity_rx = engine.subscribe_activity();
    tokio::spawn(async move {
        loop {
            match activity_rx.recv().await {
                Ok(event) => {
                    if let Some(current) = event.current {
                        info!(
                            seq = event.seq,
                            cause = ?event.cause,
                            label = %current.label,
                            "activity changed"
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("activity receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Stdin is read on a plain thread: a blocking read cannot be cancelled and
/// would otherwise hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_console(state: &AppState) -> anyhow::Result<()> {
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    loop {
        let line = tokio::select! {
            line = lines.recv(), if stdin_open => line,
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for interrupt")?;
                info!("interrupt received");
                return Ok(());
            }
        };
        let Some(line) = line else {
            // stdin closed; keep running until interrupted.
            stdin_open = false;
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", commands::reply(Err(e)));
                continue;
            }
        };
        let quit = command == Command::Quit;
        println!("{}", commands::reply(commands::execute(state, command).await));
        if quit {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vigil_core=info")),
        )
        .init();

    info!("Vigil starting");

    let settings_path = parse_settings_arg()?.unwrap_or_else(default_settings_path);
    let app_settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &app_settings) {
            warn!("could not write default settings to {}: {e}", settings_path.display());
        }
    }
    info!(
        settings_path = ?settings_path,
        audio_source = ?app_settings.audio_source,
        classifier = ?app_settings.classifier,
        forwarder = app_settings.forwarder.url.is_some(),
        "runtime settings loaded"
    );

    // ── Storage ───────────────────────────────────────────────────────────
    let db_path = app_settings.database_path(&settings_path);
    let store = Arc::new(
        SqliteStore::new(db_path.clone())
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("opening history database {}", db_path.display()))?,
    );
    match store.prune(app_settings.retention_days) {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "pruned expired history"),
        Err(e) => warn!("history prune failed at startup: {e}"),
    }

    // ── Engine setup ──────────────────────────────────────────────────────
    let engine = Arc::new(
        VigilEngine::new(
            app_settings.engine.clone(),
            build_sources(&app_settings),
            build_classifier(&app_settings),
            store.clone(),
        )
        .context("invalid engine configuration")?,
    );
    if let Err(e) = engine.warm_up() {
        error!("classifier warm-up failed: {e}");
    }

    match Forwarder::from_settings(&app_settings.forwarder) {
        Ok(Some(forwarder)) => {
            let _forwarding = forwarder.spawn(engine.subscribe_activity());
        }
        Ok(None) => {}
        Err(e) => warn!("history forwarding disabled: {e}"),
    }
    spawn_status_logger(&engine);

    engine.start().context("starting engine")?;
    let state = AppState::new(Arc::clone(&engine), store, app_settings, settings_path);

    let console = run_console(&state).await;

    if engine.is_running() {
        if let Err(e) = engine.stop().await {
            warn!("engine stop failed: {e}");
        }
    }
    info!(uptime_secs = state.uptime_secs(), "Vigil stopped");
    console
}
