//! Blocking client for the native protocol.
//!
//! Used by the interactive CLI and by the session tests, which drive a real server over
//! loopback sockets.
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use log::debug;
use thiserror::Error;

use crate::block::Block;

use super::{
    codec::{BlockInput, BlockOutput, CodecError},
    packet::{
        BlockPayload, ClientHello, ClientPacket, Compression, ExceptionPayload, ProfileInfo,
        Progress, QueryPacket, SERVER_REVISION, ServerHello, ServerPacket, VERSION_MAJOR,
        VERSION_MINOR,
    },
    transport::{ProtocolTransport, TransportError},
};

const CLIENT_NAME: &str = "blockwire-client";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("server exception {}: {}", .0.name, .0.message)]
    Server(ExceptionPayload),
    #[error("unexpected {0} packet from server")]
    UnexpectedPacket(&'static str),
    #[error("server closed the connection")]
    Disconnected,
}

/// Everything the server sent for one query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub blocks: Vec<Block>,
    /// Sum of all Progress packets.
    pub progress: Progress,
    pub progress_packets: usize,
    pub profile_info: Option<ProfileInfo>,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
}

impl QueryResult {
    pub fn rows(&self) -> usize {
        self.blocks.iter().map(Block::rows).sum()
    }
}

pub struct Client<T: Read + Write> {
    transport: ProtocolTransport<T>,
    hello: ClientHello,
    compression: Compression,
    block_in: BlockInput,
    block_out: BlockOutput,
}

impl Client<TcpStream> {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).map_err(TransportError::from)?;
        Ok(Self::new(stream))
    }
}

impl<T: Read + Write> Client<T> {
    pub fn new(stream: T) -> Self {
        Self {
            transport: ProtocolTransport::new(stream),
            hello: ClientHello {
                name: CLIENT_NAME.to_string(),
                version_major: VERSION_MAJOR,
                version_minor: VERSION_MINOR,
                revision: SERVER_REVISION,
                database: String::new(),
                user: "default".to_string(),
                password: String::new(),
            },
            compression: Compression::Disable,
            block_in: BlockInput::default(),
            block_out: BlockOutput::default(),
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.hello.revision = revision;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.hello.database = database.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.hello.user = user.into();
        self.hello.password = password.into();
        self
    }

    /// Compression requested for queries sent through [`query`](Self::query) and
    /// [`insert`](Self::insert).
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn transport_mut(&mut self) -> &mut ProtocolTransport<T> {
        &mut self.transport
    }

    pub fn hello(&mut self) -> Result<ServerHello, ClientError> {
        self.transport
            .write_client_packet(&ClientPacket::Hello(self.hello.clone()))?;
        match self.receive()? {
            ServerPacket::Hello(hello) => {
                debug!(
                    "connected to {} {}.{} revision {}",
                    hello.name, hello.version_major, hello.version_minor, hello.revision
                );
                Ok(hello)
            }
            ServerPacket::Exception(e) => Err(ClientError::Server(e)),
            other => Err(ClientError::UnexpectedPacket(other.name())),
        }
    }

    /// Sends a Query packet and switches the block codec to its compression.
    pub fn send_query(&mut self, packet: QueryPacket) -> Result<(), ClientError> {
        self.block_in = BlockInput::new(packet.compression);
        self.block_out = BlockOutput::new(packet.compression);
        self.transport
            .write_client_packet(&ClientPacket::Query(packet))?;
        Ok(())
    }

    pub fn send_block(&mut self, block: &Block) -> Result<(), ClientError> {
        let payload = self.block_out.write(block)?;
        self.transport
            .write_client_packet(&ClientPacket::Data(payload))?;
        Ok(())
    }

    pub fn send_cancel(&mut self) -> Result<(), ClientError> {
        self.transport.write_client_packet(&ClientPacket::Cancel)?;
        Ok(())
    }

    pub fn send_ping(&mut self) -> Result<(), ClientError> {
        self.transport.write_client_packet(&ClientPacket::Ping)?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<ServerPacket, ClientError> {
        self.transport
            .read_server_packet()?
            .ok_or(ClientError::Disconnected)
    }

    pub fn decode(&self, payload: &BlockPayload) -> Result<Block, ClientError> {
        Ok(self.block_in.read(payload)?)
    }

    pub fn query(&mut self, query: &str) -> Result<QueryResult, ClientError> {
        self.query_with(QueryPacket {
            query: query.to_string(),
            compression: self.compression,
            ..Default::default()
        })
    }

    pub fn query_with(&mut self, packet: QueryPacket) -> Result<QueryResult, ClientError> {
        self.send_query(packet)?;
        self.read_result()
    }

    /// Runs an insert: the query, every block, then the terminating empty block.
    pub fn insert(
        &mut self,
        query: &str,
        blocks: impl IntoIterator<Item = Block>,
    ) -> Result<QueryResult, ClientError> {
        self.send_query(QueryPacket {
            query: query.to_string(),
            compression: self.compression,
            ..Default::default()
        })?;
        for block in blocks {
            self.send_block(&block)?;
        }
        self.send_block(&Block::empty())?;
        self.read_result()
    }

    /// Collects response packets up to EndOfStream. An Exception ends the query with an error.
    pub fn read_result(&mut self) -> Result<QueryResult, ClientError> {
        let mut result = QueryResult::default();
        loop {
            match self.receive()? {
                ServerPacket::Data(payload) => {
                    let block = self.decode(&payload)?;
                    if !block.is_empty() {
                        result.blocks.push(block);
                    }
                }
                ServerPacket::Progress(progress) => {
                    result.progress.rows += progress.rows;
                    result.progress.bytes += progress.bytes;
                    result.progress_packets += 1;
                }
                ServerPacket::ProfileInfo(info) => result.profile_info = Some(info),
                ServerPacket::Totals(payload) => result.totals = Some(self.decode(&payload)?),
                ServerPacket::Extremes(payload) => result.extremes = Some(self.decode(&payload)?),
                ServerPacket::Pong => {}
                ServerPacket::EndOfStream => return Ok(result),
                ServerPacket::Exception(e) => return Err(ClientError::Server(e)),
                other => return Err(ClientError::UnexpectedPacket(other.name())),
            }
        }
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        self.send_ping()?;
        match self.receive()? {
            ServerPacket::Pong => Ok(()),
            ServerPacket::Exception(e) => Err(ClientError::Server(e)),
            other => Err(ClientError::UnexpectedPacket(other.name())),
        }
    }
}
