//! Execution engine seam.
//!
//! The protocol core never executes queries itself. It hands the query text to an [`Engine`]
//! and gets back a [`QueryIo`]: a pull-based [`BlockProducer`] for results and/or a push-based
//! [`BlockConsumer`] for inserted data. The engine may run any number of worker threads; the
//! only things they share with the protocol thread are the [`ProgressTracker`] and the
//! [`CancellationToken`] found in the [`ExecuteContext`].
//!
//! # Key Components
//!
//! - [`Engine`]: opens a query.
//! - [`QueryClassifier`]: tells inserts from everything else.
//! - [`Authenticator`]: checks credentials during the handshake.
//! - [`memory::MemoryEngine`]: in-memory reference engine used by the server binary.
use std::sync::Arc;

use thiserror::Error;

use crate::{
    block::Block,
    error::QueryError,
    protocol::{CancellationToken, ProfileInfo, ProgressTracker, Stage},
    settings::Settings,
};

pub mod memory;
pub mod statement;

/// Everything the engine needs to start a query.
pub struct ExecuteContext<'a> {
    pub query_id: &'a str,
    pub query: &'a str,
    pub stage: Stage,
    pub settings: &'a Settings,
    pub database: &'a str,
    /// Shared with the session. Engine threads report rows and bytes of returned or
    /// consumed blocks here.
    pub progress: Arc<ProgressTracker>,
    pub cancel: CancellationToken,
}

/// Pull-based source of result blocks.
pub trait BlockProducer: Send {
    /// Next block, or `None` when exhausted.
    fn next_block(&mut self) -> Result<Option<Block>, QueryError>;

    /// Stops producing. Work already running may finish, but no more blocks are requested.
    fn cancel(&mut self) {}

    fn totals(&self) -> Option<Block> {
        None
    }

    fn extremes(&self) -> Option<Block> {
        None
    }

    fn profile_info(&self) -> Option<ProfileInfo> {
        None
    }
}

/// Push-based sink for inserted blocks.
pub trait BlockConsumer: Send {
    fn write(&mut self, block: Block) -> Result<(), QueryError>;

    /// Called once after the client's terminating block.
    fn finish(&mut self) -> Result<(), QueryError>;

    /// Called instead of [`finish`](Self::finish) when the client cancels.
    fn cancel(&mut self) -> Result<(), QueryError> {
        Ok(())
    }
}

/// Streams opened for one query. Either side may be absent, e.g. DDL has neither.
#[derive(Default)]
pub struct QueryIo {
    pub input: Option<Box<dyn BlockConsumer>>,
    pub output: Option<Box<dyn BlockProducer>>,
}

impl QueryIo {
    pub fn input(consumer: impl BlockConsumer + 'static) -> Self {
        Self {
            input: Some(Box::new(consumer)),
            output: None,
        }
    }

    pub fn output(producer: impl BlockProducer + 'static) -> Self {
        Self {
            input: None,
            output: Some(Box::new(producer)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

pub trait QueryClassifier: Send + Sync {
    fn is_insert(&self, query: &str) -> bool;
}

pub trait Engine: QueryClassifier {
    fn execute(&self, ctx: ExecuteContext<'_>) -> Result<QueryIo, QueryError>;
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AuthError(pub String);

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, password: &str) -> Result<(), AuthError>;
}

/// Accepts everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _user: &str, _password: &str) -> Result<(), AuthError> {
        Ok(())
    }
}
