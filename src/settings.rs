//! Query settings.
//!
//! A connection owns one [`Settings`] value holding its defaults. Each query works on a clone
//! with the client's overrides applied, so per-query overrides never leak into the connection.
use std::time::Duration;

use crate::error::{ErrorCode, QueryError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Maximum rows in a block produced by the engine.
    pub max_block_size: usize,
    /// Number of engine worker threads a query may use.
    pub max_threads: usize,
    /// Abort a query once it has read more rows than this. Zero disables the limit.
    pub max_rows_to_read: u64,
    /// Send per-column min/max after the result.
    pub extremes: bool,
    pub cancel_check_interval_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_block_size: 65536,
            max_threads: 2,
            max_rows_to_read: 0,
            extremes: false,
            cancel_check_interval_ms: 100,
            progress_interval_ms: 100,
        }
    }
}

impl Settings {
    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Sets a single setting by name from its textual value.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), QueryError> {
        match name {
            "max_block_size" => {
                self.max_block_size = parse(name, value)?;
                if self.max_block_size == 0 {
                    return Err(QueryError::new(
                        ErrorCode::BadArguments,
                        "max_block_size must be greater than zero",
                    ));
                }
            }
            "max_threads" => self.max_threads = parse::<usize>(name, value)?.max(1),
            "max_rows_to_read" => self.max_rows_to_read = parse(name, value)?,
            "extremes" => self.extremes = parse_bool(name, value)?,
            "cancel_check_interval_ms" => self.cancel_check_interval_ms = parse(name, value)?,
            "progress_interval_ms" => self.progress_interval_ms = parse(name, value)?,
            _ => {
                return Err(QueryError::new(
                    ErrorCode::UnknownSetting,
                    format!("unknown setting '{name}'"),
                ));
            }
        }
        Ok(())
    }

    /// Returns a copy of these settings with every override applied in order.
    pub fn overlay<'a, I>(&self, overrides: I) -> Result<Settings, QueryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut settings = self.clone();
        for (name, value) in overrides {
            settings.apply(name, value)?;
        }
        Ok(settings)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, QueryError> {
    value.trim().parse().map_err(|_| {
        QueryError::new(
            ErrorCode::BadArguments,
            format!("invalid value '{value}' for setting '{name}'"),
        )
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, QueryError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(QueryError::new(
            ErrorCode::BadArguments,
            format!("invalid value '{value}' for setting '{name}'"),
        )),
    }
}
