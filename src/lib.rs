pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod parser;
pub mod pipeline;
pub mod rules;
pub mod sink;
pub mod state;
pub mod tailer;

use anyhow::Context;
use engine::{Engine, NotificationRequest};
use pipeline::{Pipeline, PipelineCommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

/// Notifications waiting for the sink. A full queue pauses the pipeline.
const NOTIFICATION_QUEUE: usize = 256;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Daily rolling `copilot.log` in `<app dir>/logs`, plus a panic hook that
/// routes panics through tracing. Keep the guard alive; dropping it flushes.
pub fn init_logging(app_dir: &Path) -> WorkerGuard {
    let log_dir = app_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "copilot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "eve_copilot_lib=debug".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false) // log files should not contain ANSI colour codes
        .try_init();

    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        tracing::error!("PANIC at {}: {}", location, message);
    }));

    tracing::info!("EVE Copilot starting, logs in {}", log_dir.display());
    guard
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run() -> anyhow::Result<()> {
    let app_dir = config::app_dir();
    let _guard = init_logging(&app_dir);

    let cfg = config::load_or_default(&app_dir)?;
    // Invalid rules abort startup with every problem listed.
    let rules = cfg
        .active_rule_set()
        .with_context(|| format!("profile '{}' cannot be loaded", cfg.active_profile))?;
    tracing::info!(
        "Profile '{}' loaded: {} rule(s), {} enabled",
        cfg.active_profile,
        rules.len(),
        rules.enabled_count()
    );

    let log_tailer = cfg.tailer();
    let engine = Engine::new(rules, cfg.engine_settings());

    // --- Notification queue: pipeline -> sink task ---
    let (notify_tx, notify_rx) = mpsc::channel::<NotificationRequest>(NOTIFICATION_QUEUE);
    let sink_task = tokio::spawn(sink::run(notify_rx, sink::for_output(cfg.notification_output)));

    // --- Optional OS wake hint; the interval timer runs regardless ---
    let (_watcher, wake_rx) = if cfg.watch_fs_events {
        match tailer::watch_for_changes(&log_tailer) {
            Ok((watcher, rx)) => (Some(watcher), Some(rx)),
            Err(e) => {
                tracing::warn!("File watcher unavailable, polling only: {}", e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let (cmd_tx, cmd_rx) = mpsc::channel::<PipelineCommand>(8);
    let cancel = CancellationToken::new();

    tokio::spawn(shutdown_on_signal(cancel.clone()));
    tokio::spawn(reload_on_hangup(app_dir.clone(), cmd_tx, cancel.clone()));

    let pipeline = Pipeline::new(log_tailer, engine, notify_tx, cfg.pipeline_settings());
    let snapshot = pipeline.run(cmd_rx, wake_rx, cancel).await?;
    tracing::debug!("Final threat board: {:?}", snapshot.threats);

    // The pipeline owned the last sender, so the sink drains and stops.
    let delivered = sink_task.await.context("sink task failed")??;
    tracing::info!("EVE Copilot stopped, {} notification(s) delivered", delivered);
    Ok(())
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

/// On SIGHUP, re-read the config file and switch to its active profile.
/// A profile that fails validation is reported and the current one kept.
#[cfg(unix)]
async fn reload_on_hangup(
    app_dir: PathBuf,
    commands: mpsc::Sender<PipelineCommand>,
    cancel:   CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match reload_profile(&app_dir) {
                    Ok(command) => {
                        if commands.send(command).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::error!("Profile reload rejected: {:#}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _app_dir:  PathBuf,
    _commands: mpsc::Sender<PipelineCommand>,
    _cancel:   CancellationToken,
) {
}

/// Load the config from `app_dir` and compile its active profile into a
/// switch command for the running pipeline.
pub fn reload_profile(app_dir: &Path) -> anyhow::Result<PipelineCommand> {
    let cfg = config::load_or_default(app_dir)?;
    let rules = cfg.active_rule_set()?;
    tracing::info!("Reloaded profile '{}' ({} rule(s))", cfg.active_profile, rules.len());
    Ok(PipelineCommand::SwitchProfile { name: cfg.active_profile, rules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::AppConfig;
    use tempfile::tempdir;

    #[test]
    fn reload_compiles_the_active_profile() {
        let dir = tempdir().unwrap();
        let cfg = AppConfig { active_profile: "general".to_owned(), ..AppConfig::default() };
        config::save(&cfg, dir.path()).unwrap();

        let PipelineCommand::SwitchProfile { name, rules } = reload_profile(dir.path()).unwrap();
        assert_eq!(name, "general");
        assert!(rules.get("heavy_damage").is_some());
    }

    #[test]
    fn reload_rejects_invalid_rules() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(config::CONFIG_FILE),
            r#"
active_profile = "broken"

[[profiles.broken.rules]]
id      = "shield"
events  = ["shield_level"]
message = ""
"#,
        )
        .unwrap();

        let err = reload_profile(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<error::ConfigError>(),
            Some(error::ConfigError::InvalidRules(errors)) if errors.len() == 1
        ));
    }

    #[tokio::test]
    async fn shutdown_task_exits_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown_on_signal(cancel))
            .await
            .unwrap();
    }
}
