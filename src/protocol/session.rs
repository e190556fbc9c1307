//! Per-connection protocol driver.
//!
//! A [`ConnectionSession`] owns one client socket for its whole life. It performs the
//! handshake once, then serves queries one at a time:
//!
//! ```text
//! Idle -> Handshaking -> Idle(ready) -> QueryReceived -> { InsertReceiving -> Executing | Executing }
//!      -> Streaming -> { Completed | Cancelled | Errored } -> Idle
//! ```
//!
//! The per-query boundary in [`run`](ConnectionSession::run) is the only recovery point. A
//! [`QueryError`](crate::error::QueryError) there becomes one Exception packet and the
//! connection waits for the next Query. Handshake, framing and socket failures end the
//! connection.
use std::sync::Arc;

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    block::Block,
    config::ServerConfig,
    engine::{Authenticator, BlockConsumer, BlockProducer, Engine, ExecuteContext},
    error::{ErrorCode, ProtocolError, QueryError, SessionError},
    settings::Settings,
};

use super::{
    cancel::{CancelCheck, CancellationMonitor},
    codec::{BlockInput, BlockOutput},
    packet::{
        BlockPayload, ClientHello, ClientPacket, ExceptionPayload, MIN_CLIENT_REVISION,
        ProfileInfo, Progress, QueryPacket, REVISION_WITH_PROFILE_INFO,
        REVISION_WITH_TOTALS_EXTREMES, SERVER_REVISION, ServerHello, ServerPacket,
    },
    state::{QueryPhase, QueryState},
    timer::{RateLimit, Stopwatch},
    transport::{PeekStream, ProtocolTransport, TransportError},
};

const DEFAULT_DATABASE: &str = "default";

/// How the client ended its insert data.
enum InputEnd {
    Finished,
    Cancelled,
}

pub struct ConnectionSession<T: PeekStream> {
    transport: ProtocolTransport<T>,
    engine: Arc<dyn Engine>,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<ServerConfig>,

    client_name: String,
    client_revision: u64,
    default_database: String,
    connection_settings: Settings,

    /// Only one query runs per connection at a time.
    state: QueryState,
    cancel_monitor: CancellationMonitor,
    after_send_progress: RateLimit,
}

impl<T: PeekStream> ConnectionSession<T> {
    pub fn new(
        stream: T,
        engine: Arc<dyn Engine>,
        authenticator: Arc<dyn Authenticator>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let connection_settings = config.default_settings.clone();
        Self {
            transport: ProtocolTransport::new(stream).with_max_frame_size(config.max_frame_size),
            cancel_monitor: CancellationMonitor::new(connection_settings.cancel_check_interval()),
            after_send_progress: RateLimit::new(connection_settings.progress_interval()),
            engine,
            authenticator,
            config,
            client_name: String::new(),
            client_revision: 0,
            default_database: DEFAULT_DATABASE.to_string(),
            connection_settings,
            state: QueryState::default(),
        }
    }

    /// Serves the connection until the client disconnects or a fatal error occurs. The socket
    /// is released when this returns, whatever the outcome.
    pub fn run(mut self) -> Result<(), SessionError> {
        let res = self.run_impl();

        // Let engine workers of an abandoned query stop.
        self.state.cancel.cancel();

        if let Err(e) = &res {
            match e {
                SessionError::Transport(_) => {}
                _ => {
                    if let Err(send) = self.send_exception(e) {
                        debug!("could not report fatal error to client: {send}");
                    }
                }
            }
        }
        res
    }

    fn run_impl(&mut self) -> Result<(), SessionError> {
        if !self.receive_hello()? {
            info!("client closed the connection before the handshake");
            return Ok(());
        }
        self.send_hello()?;

        loop {
            match self.serve_packet() {
                Ok(true) => {}
                Ok(false) => {
                    info!("client {} disconnected", self.client_name);
                    return Ok(());
                }
                Err(e) if !e.is_fatal() => self.recover(e)?,
                Err(e) => return Err(e),
            }
            if self.state.phase.is_terminal() {
                debug!("[{}] query ended {:?}", self.state.query_id, self.state.phase);
            }
            self.state.reset();
        }
    }

    /// Receives one packet and, if it opened a query, runs that query to completion.
    fn serve_packet(&mut self) -> Result<bool, SessionError> {
        if !self.receive_packet()? {
            return Ok(false);
        }
        if self.state.empty() {
            return Ok(true);
        }

        if self.state.is_insert {
            self.process_insert_query()?;
        } else {
            self.process_ordinary_query()?;
        }
        Ok(true)
    }

    /// Turns a query fault into an Exception packet, leaving the connection usable.
    fn recover(&mut self, err: SessionError) -> Result<(), SessionError> {
        warn!("[{}] query failed: {err}", self.state.query_id);
        self.state.phase = QueryPhase::Errored;
        self.state.cancel.cancel();
        if let Some(producer) = self.state.io.output.as_mut() {
            producer.cancel();
        }
        if let Some(consumer) = self.state.io.input.as_mut() {
            if let Err(e) = consumer.cancel() {
                debug!("[{}] insert abort failed: {e}", self.state.query_id);
            }
        }

        if self.state.is_insert && !self.state.input_finished {
            self.skip_data()?;
        }
        self.send_exception(&err)
    }

    fn receive_hello(&mut self) -> Result<bool, SessionError> {
        let Some(packet) = self.transport.read_client_packet()? else {
            return Ok(false);
        };
        let hello: ClientHello = match packet {
            ClientPacket::Hello(hello) => hello,
            other => {
                return Err(ProtocolError::UnexpectedPacket {
                    expected: "Hello",
                    got: other.kind().name(),
                }
                .into());
            }
        };

        if hello.revision < MIN_CLIENT_REVISION {
            return Err(ProtocolError::UnsupportedRevision {
                client: hello.revision,
                minimum: MIN_CLIENT_REVISION,
            }
            .into());
        }

        if let Err(e) = self.authenticator.authenticate(&hello.user, &hello.password) {
            warn!("authentication failed for user '{}': {e}", hello.user);
            return Err(ProtocolError::Authentication(hello.user).into());
        }

        self.client_revision = hello.revision.min(SERVER_REVISION);
        self.client_name = hello.name;
        if !hello.database.is_empty() {
            self.default_database = hello.database;
        }

        info!(
            "connected {} version {}.{}, revision {}, database {}, user '{}'",
            self.client_name,
            hello.version_major,
            hello.version_minor,
            self.client_revision,
            self.default_database,
            hello.user,
        );
        Ok(true)
    }

    fn send_hello(&mut self) -> Result<(), SessionError> {
        let hello = ServerHello {
            name: self.config.name.clone(),
            ..Default::default()
        };
        self.transport
            .write_server_packet(&ServerPacket::Hello(hello))?;
        Ok(())
    }

    /// Reads and dispatches one packet while idle. Returns false on a clean EOF.
    fn receive_packet(&mut self) -> Result<bool, SessionError> {
        let Some(packet) = self.transport.read_client_packet()? else {
            return Ok(false);
        };
        debug!("received {} packet", packet.kind().name());

        match packet {
            ClientPacket::Query(query) => {
                if !self.state.empty() {
                    return Err(ProtocolError::QueryInFlight("Query").into());
                }
                self.receive_query(query)?;
            }
            ClientPacket::Ping => self.send_pong()?,
            // A Cancel can race with the end of the query it was meant for.
            ClientPacket::Cancel => debug!("ignoring Cancel while idle"),
            other => {
                return Err(ProtocolError::UnexpectedPacket {
                    expected: "Query",
                    got: other.kind().name(),
                }
                .into());
            }
        }
        Ok(true)
    }

    fn receive_query(&mut self, packet: QueryPacket) -> Result<(), SessionError> {
        self.state.reset();

        self.state.query_id = if packet.query_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            packet.query_id
        };
        self.state.stage = packet.stage;
        self.state.compression = packet.compression;
        self.state.query = packet.query;
        self.state.is_empty = false;
        self.state.phase = QueryPhase::QueryReceived;
        self.state.is_insert = self.engine.is_insert(&self.state.query);
        self.init_block_input();
        self.init_block_output();

        info!(
            "[{}] {} query ({:?}, {:?}): {}",
            self.state.query_id,
            if self.state.is_insert {
                "insert"
            } else {
                "ordinary"
            },
            self.state.stage,
            self.state.compression,
            self.state.query
        );

        let settings = self.connection_settings.overlay(
            packet
                .settings
                .iter()
                .map(|s| (s.name.as_str(), s.value.as_str())),
        )?;

        let io = self.engine.execute(ExecuteContext {
            query_id: &self.state.query_id,
            query: &self.state.query,
            stage: self.state.stage,
            settings: &settings,
            database: &self.default_database,
            progress: Arc::clone(&self.state.progress),
            cancel: self.state.cancel.clone(),
        })?;

        self.state.io = io;
        self.state.settings = settings;
        self.state.phase = QueryPhase::Executing;
        Ok(())
    }

    fn init_block_input(&mut self) {
        self.state.block_in = BlockInput::new(self.state.compression);
    }

    fn init_block_output(&mut self) {
        self.state.block_out = BlockOutput::new(self.state.compression);
    }

    fn process_insert_query(&mut self) -> Result<(), SessionError> {
        let Some(mut consumer) = self.state.io.input.take() else {
            return Err(QueryError::new(
                ErrorCode::NotAnInsert,
                format!("query does not accept data: {}", self.state.query),
            )
            .into());
        };
        self.state.phase = QueryPhase::InsertReceiving;

        let end = match self.read_data(consumer.as_mut()) {
            Ok(end) => end,
            Err(e) => {
                // Hand the sink back so recovery can abort it.
                self.state.io.input = Some(consumer);
                return Err(e);
            }
        };

        match end {
            InputEnd::Finished => {
                self.state.phase = QueryPhase::Executing;
                consumer.finish()?;
                self.send_progress()?;
                self.state.phase = QueryPhase::Completed;
                info!("[{}] insert finished", self.state.query_id);
            }
            InputEnd::Cancelled => {
                info!("[{}] insert cancelled by client", self.state.query_id);
                self.state.is_cancelled = true;
                self.state.cancel.cancel();
                consumer.cancel()?;
                self.state.phase = QueryPhase::Cancelled;
            }
        }

        self.send_end_of_stream()
    }

    /// Feeds Data packets into the sink until the terminating block or a Cancel.
    fn read_data(&mut self, consumer: &mut dyn BlockConsumer) -> Result<InputEnd, SessionError> {
        loop {
            let packet = self
                .transport
                .read_client_packet()?
                .ok_or(TransportError::Disconnected)?;

            match packet {
                ClientPacket::Data(payload) => {
                    if !self.receive_data(consumer, &payload)? {
                        self.state.input_finished = true;
                        return Ok(InputEnd::Finished);
                    }
                }
                ClientPacket::Cancel => {
                    self.state.input_finished = true;
                    return Ok(InputEnd::Cancelled);
                }
                ClientPacket::Ping => self.send_pong()?,
                other => {
                    return Err(ProtocolError::QueryInFlight(other.kind().name()).into());
                }
            }
        }
    }

    /// Decodes one block and hands it to the sink. Returns false for the terminating block.
    fn receive_data(
        &mut self,
        consumer: &mut dyn BlockConsumer,
        payload: &BlockPayload,
    ) -> Result<bool, SessionError> {
        let block = self.state.block_in.read(payload)?;
        if block.is_empty() {
            debug!("[{}] end of insert data", self.state.query_id);
            return Ok(false);
        }

        trace!(
            "[{}] received block of {} rows",
            self.state.query_id,
            block.rows()
        );
        consumer.write(block)?;
        Ok(true)
    }

    /// Discards the rest of a failed insert's data so the next packet starts a fresh query.
    fn skip_data(&mut self) -> Result<(), SessionError> {
        debug!("[{}] skipping remaining insert data", self.state.query_id);
        loop {
            let packet = self
                .transport
                .read_client_packet()?
                .ok_or(TransportError::Disconnected)?;

            match packet {
                ClientPacket::Data(payload) => {
                    if matches!(self.state.block_in.read(&payload), Ok(block) if block.is_empty())
                    {
                        break;
                    }
                }
                ClientPacket::Cancel => break,
                ClientPacket::Ping => self.send_pong()?,
                other => {
                    return Err(ProtocolError::QueryInFlight(other.kind().name()).into());
                }
            }
        }
        self.state.input_finished = true;
        Ok(())
    }

    fn process_ordinary_query(&mut self) -> Result<(), SessionError> {
        let watch = Stopwatch::start();
        self.cancel_monitor = CancellationMonitor::new(self.state.settings.cancel_check_interval());
        self.after_send_progress = RateLimit::new(self.state.settings.progress_interval());

        let Some(mut producer) = self.state.io.output.take() else {
            self.state.phase = QueryPhase::Completed;
            return self.send_end_of_stream();
        };
        self.state.phase = QueryPhase::Streaming;

        let sent = match self.stream_blocks(producer.as_mut()) {
            Ok(sent) => sent,
            Err(e) => {
                self.state.io.output = Some(producer);
                return Err(e);
            }
        };

        if self.state.is_cancelled {
            producer.cancel();
            self.send_progress()?;
            self.state.phase = QueryPhase::Cancelled;
            info!(
                "[{}] query cancelled by client after {} rows",
                self.state.query_id, sent.rows
            );
            return self.send_end_of_stream();
        }

        if self.client_revision >= REVISION_WITH_PROFILE_INFO {
            if let Some(info) = producer.profile_info() {
                self.send_profile_info(info)?;
            }
        }
        if self.client_revision >= REVISION_WITH_TOTALS_EXTREMES {
            if let Some(totals) = producer.totals() {
                self.send_totals(&totals)?;
            }
            if let Some(extremes) = producer.extremes() {
                self.send_extremes(&extremes)?;
            }
        }
        self.send_progress()?;
        self.state.phase = QueryPhase::Completed;
        self.log_profile_info(&watch, sent);

        self.send_end_of_stream()
    }

    /// Pulls blocks until the producer is exhausted or the client cancels. Returns the rows and
    /// bytes sent.
    ///
    /// Cancellation is checked between pulling a block and sending it, so a block the producer
    /// was still computing when the Cancel arrived is dropped.
    fn stream_blocks(&mut self, producer: &mut dyn BlockProducer) -> Result<Progress, SessionError> {
        let mut sent = Progress::default();

        loop {
            let next = producer.next_block()?;
            if self.is_query_cancelled()? {
                return Ok(sent);
            }

            if self.after_send_progress.due() {
                self.send_progress()?;
            }

            let Some(block) = next else {
                return Ok(sent);
            };
            if block.is_empty() {
                continue;
            }

            sent.rows += block.rows() as u64;
            sent.bytes += block.byte_size() as u64;
            self.send_data(&block)?;
        }
    }

    /// Non-blocking check for a Cancel from the client, at most once per check interval.
    /// A Ping is answered and does not cancel.
    fn is_query_cancelled(&mut self) -> Result<bool, SessionError> {
        if self.state.is_cancelled {
            return Ok(true);
        }

        match self.cancel_monitor.check(&mut self.transport)? {
            CancelCheck::Idle => Ok(false),
            CancelCheck::Cancelled => {
                info!("[{}] received Cancel", self.state.query_id);
                self.state.is_cancelled = true;
                self.state.cancel.cancel();
                Ok(true)
            }
            CancelCheck::Ping => {
                self.send_pong()?;
                Ok(false)
            }
            CancelCheck::Unexpected(kind) => Err(ProtocolError::QueryInFlight(kind.name()).into()),
        }
    }

    fn send_data(&mut self, block: &Block) -> Result<(), SessionError> {
        let payload = self.state.block_out.write(block)?;
        trace!(
            "[{}] sending block of {} rows, {} bytes on the wire",
            self.state.query_id,
            block.rows(),
            payload.0.len()
        );
        self.transport
            .write_server_packet(&ServerPacket::Data(payload))?;
        Ok(())
    }

    /// Sends the progress accumulated since the last call, if any.
    fn send_progress(&mut self) -> Result<(), SessionError> {
        let progress = self.state.progress.take();
        if progress.is_empty() {
            return Ok(());
        }
        debug!(
            "[{}] progress: {} rows, {} bytes",
            self.state.query_id, progress.rows, progress.bytes
        );
        self.transport
            .write_server_packet(&ServerPacket::Progress(progress))?;
        Ok(())
    }

    fn send_profile_info(&mut self, info: ProfileInfo) -> Result<(), SessionError> {
        self.transport
            .write_server_packet(&ServerPacket::ProfileInfo(info))?;
        Ok(())
    }

    fn send_totals(&mut self, totals: &Block) -> Result<(), SessionError> {
        let payload = self.state.block_out.write(totals)?;
        self.transport
            .write_server_packet(&ServerPacket::Totals(payload))?;
        Ok(())
    }

    fn send_extremes(&mut self, extremes: &Block) -> Result<(), SessionError> {
        let payload = self.state.block_out.write(extremes)?;
        self.transport
            .write_server_packet(&ServerPacket::Extremes(payload))?;
        Ok(())
    }

    fn send_end_of_stream(&mut self) -> Result<(), SessionError> {
        self.transport
            .write_server_packet(&ServerPacket::EndOfStream)?;
        self.state.sent_all_data = true;
        Ok(())
    }

    fn send_pong(&mut self) -> Result<(), SessionError> {
        self.transport.write_server_packet(&ServerPacket::Pong)?;
        Ok(())
    }

    fn send_exception(&mut self, err: &SessionError) -> Result<(), SessionError> {
        let payload = match err {
            SessionError::Query(e) => ExceptionPayload::from(e),
            SessionError::Protocol(e) => {
                ExceptionPayload::new(e.code(), &e.to_string(), Some(format!("{e:?}")))
            }
            SessionError::Transport(e) => {
                ExceptionPayload::new(ErrorCode::Internal, &e.to_string(), Some(format!("{e:?}")))
            }
        };
        self.transport
            .write_server_packet(&ServerPacket::Exception(payload))?;
        Ok(())
    }

    fn log_profile_info(&self, watch: &Stopwatch, sent: Progress) {
        if sent.rows == 0 {
            return;
        }
        let seconds = watch.elapsed().as_secs_f64().max(f64::EPSILON);
        let mib = sent.bytes as f64 / 1_048_576.0;
        info!(
            "[{}] sent {} rows, {:.3} MiB in {:.3} sec., {:.0} rows/sec., {:.3} MiB/sec.",
            self.state.query_id,
            sent.rows,
            mib,
            seconds,
            sent.rows as f64 / seconds,
            mib / seconds
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        sync::{Mutex, mpsc},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        block::{Column, ColumnData},
        engine::{AllowAll, QueryClassifier, QueryIo, memory::MemoryEngine},
        error::QueryError,
        protocol::{
            ProgressTracker,
            client::{Client, ClientError},
            packet::{Compression, SettingOverride},
        },
    };

    type SessionHandle = thread::JoinHandle<Result<(), SessionError>>;

    /// Produces one single-row block per call. The query `fail` errors after three blocks.
    struct ScriptedEngine {
        blocks: usize,
        gate_after: usize,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl ScriptedEngine {
        fn new(blocks: usize) -> Self {
            Self {
                blocks,
                gate_after: usize::MAX,
                gate: Mutex::new(None),
            }
        }

        /// The first query blocks before producing block `after` until the sender fires.
        fn gated(blocks: usize, after: usize) -> (Self, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let engine = Self {
                blocks,
                gate_after: after,
                gate: Mutex::new(Some(rx)),
            };
            (engine, tx)
        }
    }

    impl QueryClassifier for ScriptedEngine {
        fn is_insert(&self, _query: &str) -> bool {
            false
        }
    }

    impl Engine for ScriptedEngine {
        fn execute(&self, ctx: ExecuteContext<'_>) -> Result<QueryIo, QueryError> {
            Ok(QueryIo::output(ScriptedProducer {
                produced: 0,
                blocks: self.blocks,
                fail_after: (ctx.query == "fail").then_some(3),
                gate_after: self.gate_after,
                gate: self.gate.lock().unwrap().take(),
                progress: Arc::clone(&ctx.progress),
            }))
        }
    }

    struct ScriptedProducer {
        produced: usize,
        blocks: usize,
        fail_after: Option<usize>,
        gate_after: usize,
        gate: Option<mpsc::Receiver<()>>,
        progress: Arc<ProgressTracker>,
    }

    impl BlockProducer for ScriptedProducer {
        fn next_block(&mut self) -> Result<Option<Block>, QueryError> {
            if Some(self.produced) == self.fail_after {
                return Err(QueryError::new(ErrorCode::Internal, "scripted failure"));
            }
            if self.produced == self.gate_after {
                if let Some(gate) = self.gate.take() {
                    gate.recv_timeout(Duration::from_secs(10)).unwrap();
                }
            }
            if self.produced >= self.blocks {
                return Ok(None);
            }

            let block = Block::new(vec![Column::new(
                "n",
                ColumnData::UInt64(vec![self.produced as u64]),
            )])
            .unwrap();
            self.progress.update(1, 8);
            self.produced += 1;
            Ok(Some(block))
        }
    }

    #[derive(Debug, Default)]
    struct InsertLog {
        blocks: Vec<Block>,
        finished: bool,
        cancelled: bool,
    }

    /// Accepts every query as an insert and records what reaches the sink.
    #[derive(Default)]
    struct RecordingEngine {
        log: Arc<Mutex<InsertLog>>,
    }

    impl QueryClassifier for RecordingEngine {
        fn is_insert(&self, _query: &str) -> bool {
            true
        }
    }

    impl Engine for RecordingEngine {
        fn execute(&self, _ctx: ExecuteContext<'_>) -> Result<QueryIo, QueryError> {
            Ok(QueryIo::input(RecordingSink(Arc::clone(&self.log))))
        }
    }

    struct RecordingSink(Arc<Mutex<InsertLog>>);

    impl BlockConsumer for RecordingSink {
        fn write(&mut self, block: Block) -> Result<(), QueryError> {
            self.0.lock().unwrap().blocks.push(block);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), QueryError> {
            self.0.lock().unwrap().finished = true;
            Ok(())
        }

        fn cancel(&mut self) -> Result<(), QueryError> {
            self.0.lock().unwrap().cancelled = true;
            Ok(())
        }
    }

    fn start(engine: Arc<dyn Engine>) -> (Client<TcpStream>, SessionHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            ConnectionSession::new(
                stream,
                engine,
                Arc::new(AllowAll),
                Arc::new(ServerConfig::default()),
            )
            .run()
        });
        (Client::connect(addr).unwrap(), handle)
    }

    fn connected(engine: Arc<dyn Engine>) -> (Client<TcpStream>, SessionHandle) {
        let (mut client, handle) = start(engine);
        client.hello().unwrap();
        (client, handle)
    }

    fn finish(client: Client<TcpStream>, handle: SessionHandle) {
        drop(client);
        handle.join().unwrap().unwrap();
    }

    /// A query whose cancel checks and progress sends are never rate limited.
    fn eager(query: &str, extra: &[(&str, &str)]) -> QueryPacket {
        let mut settings = vec![
            SettingOverride {
                name: "cancel_check_interval_ms".into(),
                value: "0".into(),
            },
            SettingOverride {
                name: "progress_interval_ms".into(),
                value: "0".into(),
            },
        ];
        settings.extend(extra.iter().map(|(name, value)| SettingOverride {
            name: name.to_string(),
            value: value.to_string(),
        }));
        QueryPacket {
            query: query.to_string(),
            settings,
            ..Default::default()
        }
    }

    /// Reads packets up to and including EndOfStream or Exception.
    fn collect(client: &mut Client<TcpStream>) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        loop {
            let packet = client.receive().unwrap();
            let last = matches!(
                packet,
                ServerPacket::EndOfStream | ServerPacket::Exception(_)
            );
            packets.push(packet);
            if last {
                return packets;
            }
        }
    }

    fn count_data(packets: &[ServerPacket]) -> usize {
        packets
            .iter()
            .filter(|p| matches!(p, ServerPacket::Data(_)))
            .count()
    }

    fn read_data_packets(client: &mut Client<TcpStream>, n: usize) {
        let mut seen = 0;
        while seen < n {
            match client.receive().unwrap() {
                ServerPacket::Data(_) => seen += 1,
                ServerPacket::Progress(_) => {}
                other => panic!("unexpected {}", other.name()),
            }
        }
    }

    fn numbers(block: &Block) -> Vec<u64> {
        match &block.column("number").unwrap().data {
            ColumnData::UInt64(v) => v.clone(),
            other => panic!("unexpected column {other:?}"),
        }
    }

    fn users(ids: Vec<u64>) -> Block {
        let names = ids.iter().map(|i| format!("user{i}")).collect();
        Block::new(vec![
            Column::new("id", ColumnData::UInt64(ids)),
            Column::new("name", ColumnData::String(names)),
        ])
        .unwrap()
    }

    fn server_error(res: Result<impl std::fmt::Debug, ClientError>) -> String {
        match res {
            Err(ClientError::Server(e)) => e.name,
            other => panic!("expected server exception, got {other:?}"),
        }
    }

    #[test]
    fn handshake() {
        let (mut client, handle) = start(Arc::new(ScriptedEngine::new(0)));
        let hello = client.hello().unwrap();

        assert_eq!(hello.name, "blockwire");
        assert_eq!(hello.revision, SERVER_REVISION);
        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn unsupported_revision_closes_connection() {
        let (client, handle) = start(Arc::new(ScriptedEngine::new(0)));
        let mut client = client.with_revision(0);

        assert_eq!(server_error(client.hello()), "UNSUPPORTED_REVISION");
        assert!(matches!(client.receive(), Err(ClientError::Disconnected)));
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(
                ProtocolError::UnsupportedRevision { client: 0, .. }
            ))
        ));
    }

    #[test]
    fn data_while_idle_is_fatal() {
        let (mut client, handle) = connected(Arc::new(ScriptedEngine::new(0)));
        client.send_block(&Block::empty()).unwrap();

        assert!(matches!(
            client.receive().unwrap(),
            ServerPacket::Exception(e) if e.name == "UNEXPECTED_PACKET_FROM_CLIENT"
        ));
        assert!(matches!(client.receive(), Err(ClientError::Disconnected)));
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn eof_before_handshake_is_clean() {
        let (client, handle) = start(Arc::new(ScriptedEngine::new(0)));
        finish(client, handle);
    }

    #[test]
    fn select_streams_blocks_in_order() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(2)));

        let result = client
            .query_with(eager(
                "SELECT * FROM numbers(1000)",
                &[("max_block_size", "100")],
            ))
            .unwrap();

        assert_eq!(result.blocks.len(), 10);
        let all: Vec<u64> = result.blocks.iter().flat_map(numbers).collect();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
        assert_eq!(result.progress.rows, 1000);
        assert_eq!(result.progress.bytes, 8000);
        let info = result.profile_info.unwrap();
        assert_eq!(info.rows, 1000);
        assert!(!info.applied_limit);
        finish(client, handle);
    }

    #[test]
    fn progress_is_flushed_before_end_of_stream() {
        let (mut client, handle) = connected(Arc::new(ScriptedEngine::new(5)));

        // Progress is never due with an hour-long interval, so it all arrives in the final flush.
        client
            .send_query(QueryPacket {
                query: "select".into(),
                settings: vec![SettingOverride {
                    name: "progress_interval_ms".into(),
                    value: "3600000".into(),
                }],
                ..Default::default()
            })
            .unwrap();
        let packets = collect(&mut client);

        let progress: Vec<_> = packets
            .iter()
            .filter_map(|p| match p {
                ServerPacket::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![Progress { rows: 5, bytes: 40 }]);
        assert_eq!(count_data(&packets), 5);
        assert!(matches!(
            &packets[packets.len() - 2],
            ServerPacket::Progress(_)
        ));
        finish(client, handle);
    }

    #[test]
    fn limit_progress_matches_returned_rows() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(2)));

        let result = client
            .query_with(eager("SELECT * FROM numbers(100000) LIMIT 10", &[]))
            .unwrap();

        assert_eq!(result.rows(), 10);
        assert_eq!(result.progress, Progress { rows: 10, bytes: 80 });
        assert_eq!(result.profile_info.unwrap().rows_before_limit, 100000);
        finish(client, handle);
    }

    #[test]
    fn compressed_query() {
        let (client, handle) = start(Arc::new(MemoryEngine::new(1)));
        let mut client = client.with_compression(Compression::Enable);
        client.hello().unwrap();

        let result = client.query("SELECT * FROM numbers(500)").unwrap();
        assert_eq!(result.rows(), 500);
        assert_eq!(numbers(&result.blocks[0])[499], 499);

        client.query("CREATE TABLE users (id UInt64, name String)").unwrap();
        client.insert("INSERT INTO users", [users(vec![1, 2, 3])]).unwrap();
        let result = client.query("SELECT * FROM users").unwrap();
        assert_eq!(result.blocks, vec![users(vec![1, 2, 3])]);
        finish(client, handle);
    }

    #[test]
    fn revision_gates_summary_packets() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new(1));
        let query = || {
            eager(
                "SELECT * FROM numbers(10) WITH TOTALS",
                &[("extremes", "1")],
            )
        };

        let (client, handle) = start(Arc::clone(&engine));
        let mut old = client.with_revision(1);
        old.hello().unwrap();
        let result = old.query_with(query()).unwrap();
        assert_eq!(result.rows(), 10);
        assert!(result.profile_info.is_none());
        assert!(result.totals.is_none());
        assert!(result.extremes.is_none());
        finish(old, handle);

        let (mut current, handle) = connected(engine);
        let result = current.query_with(query()).unwrap();
        assert_eq!(result.profile_info.unwrap().rows, 10);
        assert_eq!(numbers(&result.totals.unwrap()), vec![45]);
        assert_eq!(numbers(&result.extremes.unwrap()), vec![0, 9]);
        finish(current, handle);
    }

    #[test]
    fn cancel_before_first_block() {
        let (mut client, handle) = connected(Arc::new(ScriptedEngine::new(100)));

        // Both frames land in the socket together, so the first check sees the Cancel.
        let transport = client.transport_mut();
        let mut frames = transport
            .encode_frame(&ClientPacket::Query(eager("select", &[])))
            .unwrap();
        frames.extend(transport.encode_frame(&ClientPacket::Cancel).unwrap());
        transport.write_frames(&frames).unwrap();

        let packets = collect(&mut client);
        assert_eq!(count_data(&packets), 0);
        assert_eq!(packets.last(), Some(&ServerPacket::EndOfStream));

        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn cancel_mid_stream() {
        let (engine, gate) = ScriptedEngine::gated(1_000_000, 3);
        let (mut client, handle) = connected(Arc::new(engine));

        client.send_query(eager("select", &[])).unwrap();
        read_data_packets(&mut client, 3);
        client.send_cancel().unwrap();
        gate.send(()).unwrap();

        // The block computed while the Cancel was in flight is dropped.
        let packets = collect(&mut client);
        assert_eq!(count_data(&packets), 0);
        assert!(
            packets
                .iter()
                .all(|p| matches!(p, ServerPacket::Progress(_) | ServerPacket::EndOfStream))
        );
        assert_eq!(
            packets
                .iter()
                .filter(|p| **p == ServerPacket::EndOfStream)
                .count(),
            1
        );

        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn ping_during_query_is_answered() {
        let (engine, gate) = ScriptedEngine::gated(1000, 2);
        let (mut client, handle) = connected(Arc::new(engine));

        client.send_query(eager("select", &[])).unwrap();
        read_data_packets(&mut client, 2);
        client.send_ping().unwrap();
        gate.send(()).unwrap();

        let packets = collect(&mut client);
        assert!(packets.contains(&ServerPacket::Pong));
        assert_eq!(count_data(&packets), 998);
        assert_eq!(packets.last(), Some(&ServerPacket::EndOfStream));
        finish(client, handle);
    }

    #[test]
    fn second_query_while_streaming_is_fatal() {
        let (engine, gate) = ScriptedEngine::gated(1_000_000, 1);
        let (mut client, handle) = connected(Arc::new(engine));

        client.send_query(eager("select", &[])).unwrap();
        read_data_packets(&mut client, 1);
        client.send_query(QueryPacket::default()).unwrap();
        gate.send(()).unwrap();

        // The unread Query may make the close a reset, so the Exception is not guaranteed to
        // reach the client.
        loop {
            match client.receive() {
                Ok(ServerPacket::Exception(e)) => {
                    assert_eq!(e.name, "UNEXPECTED_PACKET_FROM_CLIENT");
                    break;
                }
                Ok(ServerPacket::EndOfStream) => panic!("query was not aborted"),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(ProtocolError::QueryInFlight("Query")))
        ));
    }

    #[test]
    fn failure_mid_stream_keeps_connection() {
        let (mut client, handle) = connected(Arc::new(ScriptedEngine::new(10)));

        client.send_query(eager("fail", &[])).unwrap();
        let packets = collect(&mut client);
        assert_eq!(count_data(&packets), 3);
        assert!(!packets.contains(&ServerPacket::EndOfStream));
        match packets.last() {
            Some(ServerPacket::Exception(e)) => {
                assert_eq!(e.name, "INTERNAL_ERROR");
                assert!(e.message.contains("scripted failure"));
            }
            other => panic!("expected exception, got {other:?}"),
        }

        let result = client.query("select").unwrap();
        assert_eq!(result.rows(), 10);
        finish(client, handle);
    }

    #[test]
    fn query_errors_are_reported() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(1)));

        assert_eq!(
            server_error(client.query("SELECT * FROM missing")),
            "UNKNOWN_TABLE"
        );
        assert_eq!(server_error(client.query("SELEKT 1")), "SYNTAX_ERROR");
        assert_eq!(
            server_error(client.query_with(eager("SELECT * FROM numbers(1)", &[("bogus", "1")]))),
            "UNKNOWN_SETTING"
        );
        assert_eq!(
            server_error(client.query_with(eager(
                "SELECT * FROM numbers(100)",
                &[("max_rows_to_read", "10"), ("max_block_size", "10")],
            ))),
            "TOO_MANY_ROWS"
        );

        client.ping().unwrap();
        assert_eq!(client.query("SELECT * FROM numbers(3)").unwrap().rows(), 3);
        finish(client, handle);
    }

    #[test]
    fn insert_round_trip() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(1)));

        client.query("CREATE TABLE users (id UInt64, name String)").unwrap();
        let result = client
            .insert(
                "INSERT INTO users",
                [users(vec![1, 2]), users(vec![3]), users(vec![4, 5, 6])],
            )
            .unwrap();
        assert_eq!(result.progress.rows, 6);

        let result = client.query("SELECT * FROM default.users").unwrap();
        assert_eq!(result.rows(), 6);
        assert_eq!(result.blocks[2], users(vec![4, 5, 6]));
        finish(client, handle);
    }

    #[test]
    fn failed_insert_skips_remaining_data() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(1)));
        client.query("CREATE TABLE users (id UInt64, name String)").unwrap();

        let wrong = Block::new(vec![Column::new("id", ColumnData::Int64(vec![1]))]).unwrap();
        assert_eq!(
            server_error(client.insert("INSERT INTO users", [wrong.clone(), wrong.clone(), wrong])),
            "TYPE_MISMATCH"
        );
        assert_eq!(
            server_error(client.insert("INSERT INTO missing", [users(vec![1]), users(vec![2])])),
            "UNKNOWN_TABLE"
        );

        assert_eq!(client.query("SELECT * FROM users").unwrap().rows(), 0);
        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn cancelled_insert_is_discarded() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(1)));
        client.query("CREATE TABLE users (id UInt64, name String)").unwrap();

        client
            .send_query(QueryPacket {
                query: "INSERT INTO users".into(),
                ..Default::default()
            })
            .unwrap();
        client.send_block(&users(vec![1])).unwrap();
        client.send_ping().unwrap();
        client.send_block(&users(vec![2])).unwrap();
        client.send_cancel().unwrap();

        assert_eq!(client.receive().unwrap(), ServerPacket::Pong);
        assert_eq!(client.receive().unwrap(), ServerPacket::EndOfStream);
        assert_eq!(client.query("SELECT * FROM users").unwrap().rows(), 0);
        finish(client, handle);
    }

    #[test]
    fn inserted_blocks_reach_sink_in_order() {
        let engine = Arc::new(RecordingEngine::default());
        let (mut client, handle) = connected(engine.clone());
        let blocks = vec![users(vec![1, 2]), users(vec![3]), users(vec![4, 5])];

        client.insert("insert", blocks.clone()).unwrap();

        {
            let log = engine.log.lock().unwrap();
            assert_eq!(log.blocks, blocks);
            assert!(log.finished);
            assert!(!log.cancelled);
        }
        finish(client, handle);
    }

    #[test]
    fn cancelled_insert_keeps_only_blocks_before_cancel() {
        let engine = Arc::new(RecordingEngine::default());
        let (mut client, handle) = connected(engine.clone());

        client
            .send_query(QueryPacket {
                query: "insert".into(),
                ..Default::default()
            })
            .unwrap();
        client.send_block(&users(vec![1])).unwrap();
        client.send_block(&users(vec![2, 3])).unwrap();
        client.send_cancel().unwrap();

        assert_eq!(client.receive().unwrap(), ServerPacket::EndOfStream);
        {
            let log = engine.log.lock().unwrap();
            assert_eq!(log.blocks, vec![users(vec![1]), users(vec![2, 3])]);
            assert!(log.cancelled);
            assert!(!log.finished);
        }
        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn ragged_insert_block_is_corrupted_data() {
        let (mut client, handle) = connected(Arc::new(MemoryEngine::new(1)));
        client.query("CREATE TABLE users (id UInt64, name String)").unwrap();

        let ragged = Block::from_columns_unchecked(vec![
            Column::new("id", ColumnData::UInt64(vec![1, 2, 3])),
            Column::new("name", ColumnData::String(vec!["user1".into()])),
        ]);
        assert_eq!(
            server_error(client.insert("INSERT INTO users", [ragged, users(vec![4])])),
            "CORRUPTED_DATA"
        );

        assert_eq!(client.query("SELECT * FROM users").unwrap().rows(), 0);
        client.ping().unwrap();
        finish(client, handle);
    }

    #[test]
    fn insert_without_sink_is_rejected() {
        struct NoSink;

        impl QueryClassifier for NoSink {
            fn is_insert(&self, _query: &str) -> bool {
                true
            }
        }

        impl Engine for NoSink {
            fn execute(&self, _ctx: ExecuteContext<'_>) -> Result<QueryIo, QueryError> {
                Ok(QueryIo::default())
            }
        }

        let (mut client, handle) = connected(Arc::new(NoSink));
        assert_eq!(
            server_error(client.insert("insert", [users(vec![1])])),
            "NOT_AN_INSERT"
        );
        client.ping().unwrap();
        finish(client, handle);
    }
}
