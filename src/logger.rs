use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber.
///
/// The filter comes from `SPEEDGAUGE_LOG`, then `RUST_LOG`, then the verbosity
/// flag. When `log_file` is set the output is appended there instead of
/// stderr, which keeps the terminal UI clean.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let filter = std::env::var("SPEEDGAUGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map_or_else(
            |_| {
                if verbose {
                    EnvFilter::new("debug")
                } else {
                    EnvFilter::new("info")
                }
            },
            |value| EnvFilter::try_new(value).unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });

    let result = match file {
        Some(file) => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    if let Err(err) = result {
        eprintln!("Failed to set global default subscriber: {}", err);
    }
}
