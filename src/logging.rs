use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let file_path = env::var("HTMX_LSP_CLIENT_LOG_FILE").ok().map(PathBuf::from);
        let json_format = env::var("HTMX_LSP_CLIENT_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values supplied by the hosting environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Initialize the logging system based on configuration
///
/// Logs go to stderr by default; the server's own stdout/stdin pipes carry
/// protocol traffic and must stay clean.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, ansi) = match &config.file_path {
        Some(file_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);
    if config.json_format {
        subscriber
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_line_number(true),
            )
            .init();
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".to_string()), None)
            .with_overrides(None, Some(PathBuf::from("/tmp/client.log")));

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/client.log")));
        assert!(!config.json_format);
    }

    #[test]
    fn test_init_logging_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("client.log");

        let config = LogConfig {
            level: "debug".to_string(),
            file_path: Some(log_path.clone()),
            json_format: false,
        };

        // A second test may have installed a global subscriber already; only
        // the file creation is asserted here.
        let _ = init_logging(config);
        assert!(log_path.exists());
    }
}
