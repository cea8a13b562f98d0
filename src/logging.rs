use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;

use crate::error::LoggingError;

/// Install the process-wide logger.
///
/// Lines go to stdout and, when `file` is given, are appended to that file.
/// Transport crates are capped at `warn` so per-frame chatter stays out of the log.
pub fn init_logging(level: &str, file: Option<&Path>) -> Result<(), LoggingError> {
    let level =
        LevelFilter::from_str(level).map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
