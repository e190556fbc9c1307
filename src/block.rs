//! Columnar batches of rows.
//!
//! A [`Block`] is the unit of data transfer between client and server and through the
//! execution pipeline. It holds a list of named, typed [`Column`]s that all carry the same
//! number of values.
//!
//! An empty block (no rows) has a special meaning on the wire: during an insert it marks the
//! end of the client's input.
//!
//! # Example
//! ```rust
//! use blockwire::{Block, Column, ColumnData};
//!
//! let block = Block::new(vec![
//!     Column::new("id", ColumnData::UInt64(vec![1, 2, 3])),
//!     Column::new("name", ColumnData::String(vec!["a".into(), "b".into(), "c".into()])),
//! ])
//! .unwrap();
//!
//! assert_eq!(block.rows(), 3);
//! assert!(!block.is_empty());
//! ```
use std::fmt;

use bincode::{
    Decode, Encode,
    de::Decoder,
    error::DecodeError,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("column '{name}' has {got} rows, expected {expected}")]
    RowCountMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
}

/// Value type of a column.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ColumnType {
    UInt64,
    Int64,
    Float64,
    String,
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::UInt64 => "UInt64",
            ColumnType::Int64 => "Int64",
            ColumnType::Float64 => "Float64",
            ColumnType::String => "String",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "uint64" => Some(ColumnType::UInt64),
            "int64" => Some(ColumnType::Int64),
            "float64" => Some(ColumnType::Float64),
            "string" => Some(ColumnType::String),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum ColumnData {
    UInt64(Vec<u64>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

impl ColumnData {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::UInt64(_) => ColumnType::UInt64,
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Float64(_) => ColumnType::Float64,
            ColumnData::String(_) => ColumnType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncompressed in-memory size of the values. Strings count their bytes plus an
    /// 8-byte offset each.
    pub fn byte_size(&self) -> usize {
        match self {
            ColumnData::UInt64(v) => v.len() * size_of::<u64>(),
            ColumnData::Int64(v) => v.len() * size_of::<i64>(),
            ColumnData::Float64(v) => v.len() * size_of::<f64>(),
            ColumnData::String(v) => v.iter().map(|s| s.len() + size_of::<u64>()).sum(),
        }
    }

    pub fn slice(&self, start: usize, end: usize) -> ColumnData {
        let end = end.min(self.len());
        let start = start.min(end);
        match self {
            ColumnData::UInt64(v) => ColumnData::UInt64(v[start..end].to_vec()),
            ColumnData::Int64(v) => ColumnData::Int64(v[start..end].to_vec()),
            ColumnData::Float64(v) => ColumnData::Float64(v[start..end].to_vec()),
            ColumnData::String(v) => ColumnData::String(v[start..end].to_vec()),
        }
    }

    fn value_string(&self, row: usize) -> String {
        match self {
            ColumnData::UInt64(v) => v[row].to_string(),
            ColumnData::Int64(v) => v[row].to_string(),
            ColumnData::Float64(v) => v[row].to_string(),
            ColumnData::String(v) => v[row].clone(),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// A batch of rows stored column by column.
///
/// Decoding goes through [`Block::new`], so a block read off the wire always has equal
/// column lengths and unique column names.
#[derive(Debug, Clone, Default, Encode, PartialEq)]
pub struct Block {
    columns: Vec<Column>,
}

impl Block {
    pub fn new(columns: Vec<Column>) -> Result<Self, BlockError> {
        if let Some(first) = columns.first() {
            let expected = first.data.len();
            for (i, column) in columns.iter().enumerate() {
                if column.data.len() != expected {
                    return Err(BlockError::RowCountMismatch {
                        name: column.name.clone(),
                        expected,
                        got: column.data.len(),
                    });
                }
                if columns[..i].iter().any(|c| c.name == column.name) {
                    return Err(BlockError::DuplicateColumn(column.name.clone()));
                }
            }
        }
        Ok(Self { columns })
    }

    /// Builds a block from columns already known to have equal lengths and unique names.
    pub(crate) fn from_columns_unchecked(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// The terminating block: no columns, no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.columns.iter().map(|c| c.data.byte_size()).sum()
    }

    /// Rows `[start, end)` of this block.
    pub fn slice(&self, start: usize, end: usize) -> Block {
        Block {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.slice(start, end)))
                .collect(),
        }
    }

    /// Column names and types, for structure checks.
    pub fn structure(&self) -> Vec<(&str, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.data.column_type()))
            .collect()
    }
}

impl<Context> Decode<Context> for Block {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let columns = Vec::<Column>::decode(decoder)?;
        Block::new(columns).map_err(|e| DecodeError::OtherString(e.to_string()))
    }
}

bincode::impl_borrow_decode!(Block);

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<Vec<String>> = self
            .columns
            .iter()
            .map(|c| {
                std::iter::once(c.name.clone())
                    .chain((0..c.data.len()).map(|row| c.data.value_string(row)))
                    .collect()
            })
            .collect();
        let widths: Vec<usize> = cells
            .iter()
            .map(|col| col.iter().map(|s| s.len()).max().unwrap_or(0))
            .collect();

        for row in 0..=self.rows() {
            let line = cells
                .iter()
                .zip(&widths)
                .map(|(col, width)| format!("{:<width$}", col[row], width = *width))
                .collect::<Vec<_>>()
                .join(" | ");
            writeln!(f, "{}", line.trim_end())?;
        }
        Ok(())
    }
}
