//! In-memory reference engine.
//!
//! Tables live in a process-wide map keyed by `database.table`. Inserts are buffered by the
//! sink and appended atomically when the client finishes, so a cancelled insert leaves the
//! table untouched. `numbers(N)` is generated on the engine's worker pool and streamed back to
//! the protocol thread through a bounded channel; the generator watches the cancellation token
//! between blocks. Progress counts only the rows a select actually returns, after LIMIT.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, mpsc},
};

use log::{debug, info};

use crate::{
    block::{Block, Column, ColumnData, ColumnType},
    error::{ErrorCode, QueryError},
    protocol::{CancellationToken, ProfileInfo, ProgressTracker, Stage, ThreadPool},
};

use super::{
    BlockConsumer, BlockProducer, Engine, ExecuteContext, QueryClassifier, QueryIo,
    statement::{self, Source, Statement},
};

type Schema = Vec<(String, ColumnType)>;

#[derive(Debug)]
struct Table {
    schema: Schema,
    blocks: Vec<Block>,
}

type Tables = Arc<Mutex<HashMap<String, Table>>>;

fn lock(tables: &Tables) -> Result<MutexGuard<'_, HashMap<String, Table>>, QueryError> {
    tables
        .lock()
        .map_err(|_| QueryError::new(ErrorCode::Internal, "table registry is poisoned"))
}

pub struct MemoryEngine {
    tables: Tables,
    pool: ThreadPool,
}

impl MemoryEngine {
    pub fn new(workers: usize) -> Self {
        Self {
            tables: Arc::default(),
            pool: ThreadPool::new("engine", workers),
        }
    }

    fn create_table(&self, name: String, schema: Schema) -> Result<QueryIo, QueryError> {
        let mut tables = lock(&self.tables)?;
        if tables.contains_key(&name) {
            return Err(QueryError::new(
                ErrorCode::TableAlreadyExists,
                format!("table {name} already exists"),
            ));
        }
        info!("creating table {name}");
        tables.insert(
            name,
            Table {
                schema,
                blocks: Vec::new(),
            },
        );
        Ok(QueryIo::default())
    }

    fn drop_table(&self, name: String) -> Result<QueryIo, QueryError> {
        lock(&self.tables)?
            .remove(&name)
            .ok_or_else(|| unknown_table(&name))?;
        info!("dropped table {name}");
        Ok(QueryIo::default())
    }

    fn insert(&self, name: String, ctx: &ExecuteContext<'_>) -> Result<QueryIo, QueryError> {
        let schema = lock(&self.tables)?
            .get(&name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| unknown_table(&name))?;

        Ok(QueryIo::input(InsertSink {
            tables: Arc::clone(&self.tables),
            table: name,
            schema,
            pending: Vec::new(),
            progress: Arc::clone(&ctx.progress),
        }))
    }

    fn select_table(
        &self,
        name: String,
        ctx: &ExecuteContext<'_>,
    ) -> Result<OpenedSource, QueryError> {
        let tables = lock(&self.tables)?;
        let table = tables.get(&name).ok_or_else(|| unknown_table(&name))?;
        let blocks = table.blocks.clone();
        let total = blocks.iter().map(|b| b.rows() as u64).sum();

        Ok(OpenedSource {
            total_rows: total,
            reader: Reader::Table {
                blocks: blocks.into_iter(),
                max_rows_to_read: ctx.settings.max_rows_to_read,
                read: 0,
            },
        })
    }

    fn select_numbers(
        &self,
        n: u64,
        ctx: &ExecuteContext<'_>,
    ) -> Result<OpenedSource, QueryError> {
        let (tx, rx) = mpsc::sync_channel(ctx.settings.max_threads);
        let generator = NumbersGenerator {
            limit: n,
            block_size: ctx.settings.max_block_size as u64,
            max_rows_to_read: ctx.settings.max_rows_to_read,
            cancel: ctx.cancel.clone(),
        };
        self.pool
            .execute(move || generator.run(tx))
            .map_err(|e| QueryError::new(ErrorCode::Internal, e.to_string()))?;

        Ok(OpenedSource {
            total_rows: n,
            reader: Reader::Channel(rx),
        })
    }
}

impl QueryClassifier for MemoryEngine {
    fn is_insert(&self, query: &str) -> bool {
        statement::is_insert(query)
    }
}

impl Engine for MemoryEngine {
    fn execute(&self, ctx: ExecuteContext<'_>) -> Result<QueryIo, QueryError> {
        let stmt = Statement::try_from(ctx.query)?;
        debug!("[{}] executing {stmt:?} up to {:?}", ctx.query_id, ctx.stage);

        match stmt {
            Statement::CreateTable { table, columns } => {
                self.create_table(table.qualify(ctx.database), columns)
            }
            Statement::DropTable { table } => self.drop_table(table.qualify(ctx.database)),
            Statement::Insert { table } => self.insert(table.qualify(ctx.database), &ctx),
            Statement::Select {
                source,
                limit,
                with_totals,
            } => {
                let source = match source {
                    Source::Table(table) => {
                        self.select_table(table.qualify(ctx.database), &ctx)?
                    }
                    Source::Numbers(n) => self.select_numbers(n, &ctx)?,
                };
                Ok(QueryIo::output(SelectProducer {
                    rows_before_limit: source.total_rows,
                    reader: source.reader,
                    stage: ctx.stage,
                    limit,
                    with_totals,
                    extremes: ctx.settings.extremes,
                    progress: Arc::clone(&ctx.progress),
                    cancel: ctx.cancel.clone(),
                    summary: None,
                    sent: ProfileInfo::default(),
                }))
            }
        }
    }
}

fn unknown_table(name: &str) -> QueryError {
    QueryError::new(ErrorCode::UnknownTable, format!("table {name} doesn't exist"))
}

fn too_many_rows(read: u64, limit: u64) -> QueryError {
    QueryError::new(
        ErrorCode::TooManyRows,
        format!("limit for rows to read exceeded: read {read} rows, maximum {limit}"),
    )
}

/// Buffers inserted blocks until the client's terminating block.
struct InsertSink {
    tables: Tables,
    table: String,
    schema: Schema,
    pending: Vec<Block>,
    progress: Arc<ProgressTracker>,
}

impl BlockConsumer for InsertSink {
    fn write(&mut self, block: Block) -> Result<(), QueryError> {
        let matches = block.columns().len() == self.schema.len()
            && block
                .structure()
                .iter()
                .zip(&self.schema)
                .all(|((name, t), (expected, et))| name == expected && t == et);
        if !matches {
            return Err(QueryError::new(
                ErrorCode::TypeMismatch,
                format!(
                    "block structure {:?} does not match table {} {:?}",
                    block.structure(),
                    self.table,
                    self.schema
                ),
            ));
        }

        self.progress
            .update(block.rows() as u64, block.byte_size() as u64);
        self.pending.push(block);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), QueryError> {
        let mut tables = lock(&self.tables)?;
        let table = tables
            .get_mut(&self.table)
            .ok_or_else(|| unknown_table(&self.table))?;

        let rows: usize = self.pending.iter().map(|b| b.rows()).sum();
        table.blocks.append(&mut self.pending);
        info!("inserted {rows} rows into {}", self.table);
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), QueryError> {
        debug!(
            "discarding {} pending blocks for {}",
            self.pending.len(),
            self.table
        );
        self.pending.clear();
        Ok(())
    }
}

/// Produces `0..limit` in blocks on a worker thread.
struct NumbersGenerator {
    limit: u64,
    block_size: u64,
    max_rows_to_read: u64,
    cancel: CancellationToken,
}

impl NumbersGenerator {
    fn run(self, tx: mpsc::SyncSender<Result<Block, QueryError>>) {
        let mut next = 0;
        while next < self.limit {
            if self.cancel.is_cancelled() {
                debug!("numbers generator cancelled at {next}");
                return;
            }

            let end = (next + self.block_size).min(self.limit);
            if self.max_rows_to_read > 0 && end > self.max_rows_to_read {
                let _ = tx.send(Err(too_many_rows(end, self.max_rows_to_read)));
                return;
            }

            if tx.send(Ok(numbers_block(next, end))).is_err() {
                return;
            }
            next = end;
        }
    }
}

fn numbers_block(start: u64, end: u64) -> Block {
    Block::from_columns_unchecked(vec![Column::new(
        "number",
        ColumnData::UInt64((start..end).collect()),
    )])
}

struct OpenedSource {
    total_rows: u64,
    reader: Reader,
}

enum Reader {
    Table {
        blocks: std::vec::IntoIter<Block>,
        max_rows_to_read: u64,
        read: u64,
    },
    Channel(mpsc::Receiver<Result<Block, QueryError>>),
    Exhausted,
}

impl Reader {
    fn next(&mut self) -> Result<Option<Block>, QueryError> {
        match self {
            Reader::Table {
                blocks,
                max_rows_to_read,
                read,
            } => {
                let Some(block) = blocks.find(|b| !b.is_empty()) else {
                    return Ok(None);
                };
                *read += block.rows() as u64;
                if *max_rows_to_read > 0 && *read > *max_rows_to_read {
                    return Err(too_many_rows(*read, *max_rows_to_read));
                }
                Ok(Some(block))
            }
            // A closed channel means the generator is done.
            Reader::Channel(rx) => rx.recv().ok().transpose(),
            Reader::Exhausted => Ok(None),
        }
    }
}

struct SelectProducer {
    reader: Reader,
    stage: Stage,
    limit: Option<u64>,
    with_totals: bool,
    extremes: bool,
    rows_before_limit: u64,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    summary: Option<Summary>,
    sent: ProfileInfo,
}

impl BlockProducer for SelectProducer {
    fn next_block(&mut self) -> Result<Option<Block>, QueryError> {
        if self.stage == Stage::FetchColumns {
            return Ok(None);
        }

        let Some(mut block) = self.reader.next()? else {
            self.reader = Reader::Exhausted;
            return Ok(None);
        };

        if let Some(limit) = self.limit {
            let remaining = limit - self.sent.rows;
            if block.rows() as u64 >= remaining {
                block = block.slice(0, remaining as usize);
                // Dropping the channel stops the generator.
                self.reader = Reader::Exhausted;
            }
            if block.is_empty() {
                return Ok(None);
            }
        }

        let (rows, bytes) = (block.rows() as u64, block.byte_size() as u64);
        self.progress.update(rows, bytes);
        self.sent.rows += rows;
        self.sent.bytes += bytes;
        if self.with_totals || self.extremes {
            self.summary
                .get_or_insert_with(|| Summary::new(&block))
                .add(&block);
        }
        Ok(Some(block))
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
        self.reader = Reader::Exhausted;
    }

    fn totals(&self) -> Option<Block> {
        self.with_totals
            .then(|| self.summary.as_ref().map(Summary::totals))
            .flatten()
    }

    fn extremes(&self) -> Option<Block> {
        self.extremes
            .then(|| self.summary.as_ref().map(Summary::extremes))
            .flatten()
    }

    fn profile_info(&self) -> Option<ProfileInfo> {
        Some(ProfileInfo {
            applied_limit: self.limit.is_some(),
            rows_before_limit: self.rows_before_limit,
            ..self.sent
        })
    }
}

/// Running totals and min/max of every column seen by a producer.
#[derive(Debug)]
struct Summary {
    columns: Vec<(String, Accumulator)>,
}

#[derive(Debug)]
enum Accumulator {
    UInt64 { sum: u64, min: u64, max: u64 },
    Int64 { sum: i64, min: i64, max: i64 },
    Float64 { sum: f64, min: f64, max: f64 },
    String { bounds: Option<(String, String)> },
}

impl Summary {
    fn new(block: &Block) -> Self {
        let columns = block
            .columns()
            .iter()
            .map(|c| {
                let acc = match c.data.column_type() {
                    ColumnType::UInt64 => Accumulator::UInt64 {
                        sum: 0,
                        min: u64::MAX,
                        max: u64::MIN,
                    },
                    ColumnType::Int64 => Accumulator::Int64 {
                        sum: 0,
                        min: i64::MAX,
                        max: i64::MIN,
                    },
                    ColumnType::Float64 => Accumulator::Float64 {
                        sum: 0.0,
                        min: f64::INFINITY,
                        max: f64::NEG_INFINITY,
                    },
                    ColumnType::String => Accumulator::String { bounds: None },
                };
                (c.name.clone(), acc)
            })
            .collect();
        Self { columns }
    }

    fn add(&mut self, block: &Block) {
        for ((_, acc), column) in self.columns.iter_mut().zip(block.columns()) {
            match (acc, &column.data) {
                (Accumulator::UInt64 { sum, min, max }, ColumnData::UInt64(v)) => {
                    for &x in v {
                        *sum = sum.wrapping_add(x);
                        *min = (*min).min(x);
                        *max = (*max).max(x);
                    }
                }
                (Accumulator::Int64 { sum, min, max }, ColumnData::Int64(v)) => {
                    for &x in v {
                        *sum = sum.wrapping_add(x);
                        *min = (*min).min(x);
                        *max = (*max).max(x);
                    }
                }
                (Accumulator::Float64 { sum, min, max }, ColumnData::Float64(v)) => {
                    for &x in v {
                        *sum += x;
                        *min = min.min(x);
                        *max = max.max(x);
                    }
                }
                (Accumulator::String { bounds }, ColumnData::String(v)) => {
                    for x in v {
                        let (min, max) = bounds.get_or_insert_with(|| (x.clone(), x.clone()));
                        if x.as_str() < min.as_str() {
                            *min = x.clone();
                        }
                        if x.as_str() > max.as_str() {
                            *max = x.clone();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// One row: sums of numeric columns, empty strings elsewhere.
    fn totals(&self) -> Block {
        Block::from_columns_unchecked(
            self.columns
                .iter()
                .map(|(name, acc)| {
                    let data = match acc {
                        Accumulator::UInt64 { sum, .. } => ColumnData::UInt64(vec![*sum]),
                        Accumulator::Int64 { sum, .. } => ColumnData::Int64(vec![*sum]),
                        Accumulator::Float64 { sum, .. } => ColumnData::Float64(vec![*sum]),
                        Accumulator::String { .. } => ColumnData::String(vec![String::new()]),
                    };
                    Column::new(name.clone(), data)
                })
                .collect(),
        )
    }

    /// Two rows: minimum then maximum of each column.
    fn extremes(&self) -> Block {
        Block::from_columns_unchecked(
            self.columns
                .iter()
                .map(|(name, acc)| {
                    let data = match acc {
                        Accumulator::UInt64 { min, max, .. } => {
                            ColumnData::UInt64(vec![*min, *max])
                        }
                        Accumulator::Int64 { min, max, .. } => {
                            ColumnData::Int64(vec![*min, *max])
                        }
                        Accumulator::Float64 { min, max, .. } => {
                            ColumnData::Float64(vec![*min, *max])
                        }
                        Accumulator::String { bounds } => {
                            let (min, max) = bounds.clone().unwrap_or_default();
                            ColumnData::String(vec![min, max])
                        }
                    };
                    Column::new(name.clone(), data)
                })
                .collect(),
        )
    }
}
