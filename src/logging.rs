use std::{fs, path::PathBuf, sync::OnceLock};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::{self, WorkerGuard},
    rolling,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIR_ENV: &str = "RESULTDBX_LOG_DIR";
const LOG_FILE_PREFIX: &str = "resultdbx.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Installs the stderr subscriber, plus a daily log file when
/// `RESULTDBX_LOG_DIR` is set. Stdout is left to command output.
pub fn init() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match resolve_log_dir()? {
        Some(log_dir) => {
            fs::create_dir_all(&log_dir).with_context(|| {
                format!("failed to create log directory {}", log_dir.display())
            })?;
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(rolling::daily(&log_dir, LOG_FILE_PREFIX));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            if let Some(guard) = guard {
                let _ = FILE_GUARD.set(guard);
            }
            install_panic_hook();
        }
        Err(_) => {
            // Subscriber already installed elsewhere; drop guard so the worker thread exits.
            drop(guard);
        }
    }

    Ok(())
}

fn resolve_log_dir() -> Result<Option<PathBuf>> {
    let Ok(dir) = std::env::var(LOG_DIR_ENV) else {
        return Ok(None);
    };
    let path = PathBuf::from(dir);
    if path.is_absolute() {
        return Ok(Some(path));
    }
    let base = std::env::current_dir().context("failed to resolve current working directory")?;
    Ok(Some(base.join(path)))
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}
