//! Logging initialization

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Tracing targets that get the selected level; everything else stays at warn
const OWN_TARGETS: [&str; 3] = ["tunstack", "tunstack_core", "tunstack_platform"];

/// Filter directives used when `RUST_LOG` is unset or unparsable
fn default_directives(level: LevelFilter) -> String {
    let mut directives = vec![level.min(LevelFilter::WARN).to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Initialize logging based on CLI arguments.
///
/// `configured` is the `[logging] level` from the config file; `-v` and `-q`
/// take precedence over it. The returned guard flushes the log file when
/// dropped; keep it alive for the whole process.
pub fn init(args: &Args, configured: Option<&str>) -> Result<Option<WorkerGuard>> {
    let level = if args.quiet {
        LevelFilter::ERROR
    } else {
        match args.verbose {
            0 => configured
                .and_then(|l| l.parse().ok())
                .unwrap_or(LevelFilter::INFO),
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let (file_writer, guard) = match args.log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    match args.log_format {
        LogFormat::Text => {
            let console = fmt::layer()
                .with_target(args.verbose >= 2)
                .with_thread_ids(args.verbose >= 3)
                .with_file(args.verbose >= 3)
                .with_line_number(args.verbose >= 3);
            let file = file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w));
            registry.with(console).with(file).try_init()
        }
        LogFormat::Json => {
            let file = file_writer.map(|w| fmt::layer().json().with_writer(w));
            registry.with(fmt::layer().json()).with(file).try_init()
        }
        LogFormat::Compact => {
            let file = file_writer.map(|w| fmt::layer().compact().with_ansi(false).with_writer(w));
            registry.with(fmt::layer().compact()).with(file).try_init()
        }
    }
    .context("Failed to install log subscriber")?;

    Ok(guard)
}
