//! Process logging: a stderr layer plus, for the long-running service, a
//! daily rolling file under `<state>/service-logs/`.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE_PREFIX: &str = "repopilot";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is not set, e.g. `debug`.
    pub level: Option<String>,
    pub json: bool,
}

fn filter(options: &LogOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = options.level.as_deref().unwrap_or("info");
        EnvFilter::try_new(format!("repopilot={level}"))
            .unwrap_or_else(|_| EnvFilter::new("repopilot=info"))
    })
}

/// Install the global subscriber. The returned guard must be held for the
/// lifetime of the process when `log_dir` is given, or buffered file lines
/// are lost on exit.
pub fn init(options: &LogOptions, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_json = options.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
    });
    let stderr_text = (!options.json).then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter(options))
        .with(stderr_json)
        .with(stderr_text)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
