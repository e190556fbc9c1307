//! CLI utilities for the interactive client.
//!
//! [`prompt`] reads one command from the user; [`render`] formats what the server sent back.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::protocol::QueryResult;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, or end of input.
    Exit,
    /// Round trip check `.ping`
    Ping,
    /// Query text sent to the server as is.
    Statement(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        ".ping" => Ok(Command::Ping),
        s if !s.starts_with('.') => Ok(Command::Statement(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}

/// Result blocks as tables, followed by totals, extremes and a summary line.
pub fn render(result: &QueryResult) -> String {
    let mut out = String::new();
    for block in &result.blocks {
        out.push_str(&block.to_string());
        out.push('\n');
    }
    if let Some(totals) = &result.totals {
        out.push_str("Totals:\n");
        out.push_str(&totals.to_string());
        out.push('\n');
    }
    if let Some(extremes) = &result.extremes {
        out.push_str("Extremes:\n");
        out.push_str(&extremes.to_string());
        out.push('\n');
    }
    out.push_str(&format!(
        "{} rows in set. Processed {} rows, {} bytes.",
        result.rows(),
        result.progress.rows,
        result.progress.bytes
    ));
    out
}
