//! Logger initialization.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use log::LevelFilter;

/// Initializes `env_logger` with colored level tags.
///
/// With `log_file` set, output goes to that file (append mode) and colors
/// are disabled. `silent` turns console logging off entirely when no log
/// file is configured.
pub fn init_logger(level: LevelFilter, log_file: Option<&Path>, silent: bool) -> Result<()> {
    let mut builder = env_logger::Builder::new();

    let effective_level = if silent && log_file.is_none() {
        LevelFilter::Off
    } else {
        level
    };

    builder.filter_level(effective_level);
    // Noisy dependencies stay at their own floor regardless of -v.
    builder.filter_module("hickory_proto", LevelFilter::Error);
    builder.filter_module("reqwest", LevelFilter::Info);
    builder.filter_module("hyper", LevelFilter::Info);
    builder.filter_module("html5ever", LevelFilter::Error);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).context("creating log directory")?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            colored::control::set_override(false);
            builder.target(env_logger::Target::Pipe(Box::new(file)));
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
        None => {
            builder.format(|buf, record| {
                let level = record.level();
                let tag = match level {
                    log::Level::Error => level.to_string().red(),
                    log::Level::Warn => level.to_string().yellow(),
                    log::Level::Info => level.to_string().green(),
                    log::Level::Debug => level.to_string().blue(),
                    log::Level::Trace => level.to_string().purple(),
                };
                writeln!(buf, "[{tag}] {}", record.args())
            });
        }
    }

    builder.try_init().context("initializing logger")?;
    Ok(())
}
