pub mod block;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod settings;

pub use block::{Block, Column, ColumnData, ColumnType};
pub use cli::{Command, prompt};
pub use config::ServerConfig;
pub use engine::{Engine, memory::MemoryEngine};
pub use error::{ErrorCode, QueryError, SessionError};
pub use settings::Settings;
