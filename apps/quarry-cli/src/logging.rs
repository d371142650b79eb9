use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

const LOG_DIR_ENV: &str = "QUARRY_LOG_DIR";
const LOG_PREFIX: &str = "quarry.log";

/// Console logs on stderr filtered by `RUST_LOG` (default `info`), plus a
/// daily-rotated file under `QUARRY_LOG_DIR` when that is set.
pub fn init() {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());
    let registry = tracing_subscriber::registry().with(console);

    match std::env::var(LOG_DIR_ENV).ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            if std::fs::create_dir_all(&dir).is_err() {
                eprintln!("warning: cannot create log directory {dir}");
            }
            let writer = tracing_appender::rolling::daily(&dir, LOG_PREFIX);
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = FILE_GUARD.set(guard);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(env_filter());
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
