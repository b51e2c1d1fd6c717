use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {t} - {l} - {m}{n}";

/// Build the log4rs configuration: everything to stderr, and to `log_file`
/// when one is given. tokio-postgres is capped at info.
pub fn build_config(level: LevelFilter, log_file: Option<&Path>) -> Result<LogConfig> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder =
        LogConfig::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let config = builder
        .logger(Logger::builder().build("tokio_postgres", level.min(LevelFilter::Info)))
        .build(root.build(level))?;
    Ok(config)
}

pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    log4rs::init_config(build_config(level, log_file)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn console_only() {
        let config = build_config(LevelFilter::Info, None).unwrap();
        assert_eq!(config.appenders().len(), 1);
        assert_eq!(config.root().level(), LevelFilter::Info);
    }

    #[test]
    fn with_log_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pgstage.log");
        let config = build_config(LevelFilter::Debug, Some(&path)).unwrap();
        assert_eq!(config.appenders().len(), 2);
        assert_eq!(config.root().appenders(), ["stderr", "logfile"]);
        assert!(path.exists());
    }
}
