use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

impl LogFormat {
    pub fn parse_str(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "console" | "text" | "pretty" => Self::Console,
            _ => Self::Json,
        }
    }
}

/// `RUST_LOG` wins; otherwise `LOGGERLOGLEVEL`, otherwise `info`.
fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOGGERLOGLEVEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        EnvFilter::try_new(level.trim().to_ascii_lowercase())
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber. JSON lines unless `LOGGERLOGFORMAT=console`.
pub fn init_from_env() -> Result<()> {
    let format = std::env::var("LOGGERLOGFORMAT")
        .map(|v| LogFormat::parse_str(&v))
        .unwrap_or(LogFormat::Json);
    init(format, filter_from_env())
}

pub fn init(format: LogFormat, filter: EnvFilter) -> Result<()> {
    let (json, console) = match format {
        LogFormat::Json => (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        ),
        LogFormat::Console => (
            None,
            Some(tracing_subscriber::fmt::layer().with_target(true)),
        ),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(console)
        .try_init()
        .map_err(|e| Error::BackendMessage(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse_str("console"), LogFormat::Console);
        assert_eq!(LogFormat::parse_str(" Console "), LogFormat::Console);
        assert_eq!(LogFormat::parse_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse_str(""), LogFormat::Json);
    }
}
