use std::{fmt, sync::Arc};

use crate::{engine::QueryIo, settings::Settings};

use super::{
    cancel::CancellationToken,
    codec::{BlockInput, BlockOutput},
    packet::{Compression, Stage},
    progress::ProgressTracker,
};

/// Where the in-flight query is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryPhase {
    #[default]
    Idle,
    QueryReceived,
    InsertReceiving,
    Executing,
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl QueryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryPhase::Completed | QueryPhase::Cancelled | QueryPhase::Errored
        )
    }
}

/// The single live query of a connection.
///
/// Owned by the protocol thread. Engine workers only ever touch `progress`, through their own
/// clone of the `Arc`, and observe `cancel`.
pub struct QueryState {
    pub query_id: String,
    pub stage: Stage,
    pub compression: Compression,
    /// Decodes insert data, honouring `compression`.
    pub block_in: BlockInput,
    /// Encodes result blocks, honouring `compression`.
    pub block_out: BlockOutput,
    pub query: String,
    /// Connection settings with this query's overrides applied.
    pub settings: Settings,
    pub io: QueryIo,
    pub phase: QueryPhase,
    pub is_cancelled: bool,
    pub is_empty: bool,
    pub sent_all_data: bool,
    pub is_insert: bool,
    /// The client has sent its terminating block, or cancelled, so no more Data will arrive.
    pub input_finished: bool,
    pub progress: Arc<ProgressTracker>,
    pub cancel: CancellationToken,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            query_id: String::new(),
            stage: Stage::Complete,
            compression: Compression::Disable,
            block_in: BlockInput::default(),
            block_out: BlockOutput::default(),
            query: String::new(),
            settings: Settings::default(),
            io: QueryIo::default(),
            phase: QueryPhase::Idle,
            is_cancelled: false,
            is_empty: true,
            sent_all_data: false,
            is_insert: false,
            input_finished: false,
            progress: Arc::new(ProgressTracker::new()),
            cancel: CancellationToken::new(),
        }
    }
}

impl QueryState {
    /// Drops everything belonging to the previous query. Workers of that query keep their
    /// old tracker and can no longer affect this one.
    pub fn reset(&mut self) {
        *self = QueryState::default();
    }

    pub fn empty(&self) -> bool {
        self.is_empty
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("query_id", &self.query_id)
            .field("stage", &self.stage)
            .field("compression", &self.compression)
            .field("query", &self.query)
            .field("phase", &self.phase)
            .field("is_cancelled", &self.is_cancelled)
            .field("is_empty", &self.is_empty)
            .field("sent_all_data", &self.sent_all_data)
            .field("is_insert", &self.is_insert)
            .field("input_finished", &self.input_finished)
            .field("pending_progress", &self.progress.pending())
            .finish_non_exhaustive()
    }
}
