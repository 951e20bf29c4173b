use dotenvy::dotenv;
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info";

fn init_env_layer() -> EnvFilter {
    // should be called before reading RUST_LOG so a value in .env is picked up
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_DIRECTIVES.into())
}

pub fn init_tracing_to_stdout() {
    let env_layer = init_env_layer();

    let stdout_layer = tracing_subscriber::fmt::layer().with_ansi(true);

    tracing_subscriber::registry()
        .with(env_layer)
        .with(stdout_layer)
        .init();
}

/// Appends logs to `log_dir/file_name`, falling back to stdout when the file cannot be opened.
pub fn init_tracing_to_file(log_dir: impl AsRef<Path>, file_name: &str) {
    let log_dir = log_dir.as_ref();
    let env_layer = init_env_layer();

    let file_log_layer = {
        let file = match open_log_file(log_dir, file_name) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to open log file in {}: {}", log_dir.display(), e);
                init_tracing_to_stdout(); // fallback to stdout tracing
                return;
            }
        };
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    };

    tracing_subscriber::registry()
        .with(env_layer)
        .with(file_log_layer)
        .init();
}

/// Processes sharing a log dir must not truncate each other's logs.
fn open_log_file(log_dir: &Path, file_name: &str) -> std::io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(file_name))
}
