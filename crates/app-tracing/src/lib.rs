use dotenvy::dotenv;
use std::{path::Path, sync::Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_NAME: &str = "captioner.log";
const DEFAULT_FILTER: &str = "info";

fn init_env_layer() -> EnvFilter {
    // a missing .env is the common case
    if let Ok(path) = dotenv() {
        eprintln!(".env read successfully from {}", path.display());
    }

    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

pub fn init_tracing_to_stdout() {
    let env_layer = init_env_layer();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_layer)
        .with(stdout_layer)
        .try_init()
    {
        eprintln!("Failed to init tracing: {}", e);
    }
}

/// Log to `<log_dir>/captioner.log`, falling back to the terminal when the
/// file cannot be created.
pub fn init_tracing_to_file(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref();

    let file_log_layer = {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!("Failed to create log dir: {}", e);
            init_tracing_to_stdout();
            return;
        }
        let file = match std::fs::File::create(log_dir.join(LOG_FILE_NAME)) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to create log file: {}", e);
                init_tracing_to_stdout();
                return;
            }
        };
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(init_env_layer())
        .with(file_log_layer)
        .try_init()
    {
        eprintln!("Failed to init tracing: {}", e);
    }
}
