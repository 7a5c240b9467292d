// Config watcher - pushes brightness/interval edits from the config file into a running session
use anyhow::Result;
use notify::{Config, Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{AppConfig, LiveSettings};

/// Keep the returned watcher alive for as long as edits should apply.
pub fn watch_config(path: &Path, settings: Arc<LiveSettings>) -> Result<RecommendedWatcher> {
    let config_path: PathBuf = path.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<NotifyEvent>| {
            let Ok(NotifyEvent { kind, .. }) = res else {
                return;
            };
            if !matches!(kind, EventKind::Modify(_)) {
                return;
            }
            apply_config_file(&config_path, &settings);
        },
        Config::default(),
    )?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Re-read the record and store its live fields. Unreadable or half-written
/// files are ignored; the next modification event retries.
pub fn apply_config_file(path: &Path, settings: &LiveSettings) {
    match AppConfig::load_from(path) {
        Ok(config) => {
            let before = settings.snapshot();
            settings.store(&config.session_config());
            let after = settings.snapshot();
            if before != after {
                tracing::info!(
                    brightness = after.brightness,
                    interval_ms = after.interval.as_millis() as u64,
                    "applied config file change"
                );
            }
        }
        Err(e) => tracing::debug!("ignoring config change: {}", e),
    }
}
