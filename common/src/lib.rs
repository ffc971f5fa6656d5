pub mod cmd;
pub mod config;
pub mod db;

mod error;

pub use config::Config;
pub use error::Error;

/// Initializes process-wide logging from the configuration. When a log file
/// is configured, output is appended there without ANSI escapes; otherwise
/// it goes to stderr.
pub fn init_logging(config: &Config) -> Result<(), Error> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(false)
        .with_writer(std::io::stderr);
    match config.log_file.as_ref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}
