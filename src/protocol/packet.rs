use bincode::{Decode, Encode};

use crate::error::{ErrorCode, QueryError};

pub const SERVER_NAME: &str = "blockwire";
pub const VERSION_MAJOR: u64 = 0;
pub const VERSION_MINOR: u64 = 1;

/// Revision advertised by this server.
pub const SERVER_REVISION: u64 = 3;
/// Oldest client revision the server accepts.
pub const MIN_CLIENT_REVISION: u64 = 1;
pub const REVISION_WITH_PROFILE_INFO: u64 = 2;
pub const REVISION_WITH_TOTALS_EXTREMES: u64 = 3;

/// How far the engine should carry a query.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum Stage {
    FetchColumns,
    WithMergeableState,
    #[default]
    Complete,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Disable,
    Enable,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ClientHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
}

impl Default for ServerHello {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            revision: SERVER_REVISION,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct SettingOverride {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct QueryPacket {
    /// Empty asks the server to generate one.
    pub query_id: String,
    pub settings: Vec<SettingOverride>,
    pub stage: Stage,
    pub compression: Compression,
    pub query: String,
}

/// Rows and bytes processed since the previous Progress packet.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.bytes == 0
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ExceptionPayload {
    pub code: u32,
    pub name: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl From<&QueryError> for ExceptionPayload {
    fn from(value: &QueryError) -> Self {
        Self::new(value.code, &value.message, None)
    }
}

impl ExceptionPayload {
    pub fn new(code: ErrorCode, message: &str, stack_trace: Option<String>) -> Self {
        Self {
            code: code.code(),
            name: code.name().to_string(),
            message: message.to_string(),
            stack_trace,
        }
    }
}

/// Serialized block, possibly compressed. See [`codec`](super::codec).
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct BlockPayload(pub Vec<u8>);

/// Client to server packets. Variant order is the wire tag.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Query(QueryPacket),
    Data(BlockPayload),
    Cancel,
    Ping,
}

impl ClientPacket {
    pub fn kind(&self) -> ClientPacketKind {
        match self {
            ClientPacket::Hello(_) => ClientPacketKind::Hello,
            ClientPacket::Query(_) => ClientPacketKind::Query,
            ClientPacket::Data(_) => ClientPacketKind::Data,
            ClientPacket::Cancel => ClientPacketKind::Cancel,
            ClientPacket::Ping => ClientPacketKind::Ping,
        }
    }
}

/// Tag of a [`ClientPacket`], readable without decoding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPacketKind {
    Hello,
    Query,
    Data,
    Cancel,
    Ping,
}

impl ClientPacketKind {
    pub fn name(&self) -> &'static str {
        match self {
            ClientPacketKind::Hello => "Hello",
            ClientPacketKind::Query => "Query",
            ClientPacketKind::Data => "Data",
            ClientPacketKind::Cancel => "Cancel",
            ClientPacketKind::Ping => "Ping",
        }
    }
}

impl TryFrom<u32> for ClientPacketKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClientPacketKind::Hello),
            1 => Ok(ClientPacketKind::Query),
            2 => Ok(ClientPacketKind::Data),
            3 => Ok(ClientPacketKind::Cancel),
            4 => Ok(ClientPacketKind::Ping),
            v => Err(v),
        }
    }
}

/// Server to client packets. Variant order is the wire tag.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum ServerPacket {
    Hello(ServerHello),
    Data(BlockPayload),
    Exception(ExceptionPayload),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(BlockPayload),
    Extremes(BlockPayload),
}

impl ServerPacket {
    pub fn name(&self) -> &'static str {
        match self {
            ServerPacket::Hello(_) => "Hello",
            ServerPacket::Data(_) => "Data",
            ServerPacket::Exception(_) => "Exception",
            ServerPacket::Progress(_) => "Progress",
            ServerPacket::Pong => "Pong",
            ServerPacket::EndOfStream => "EndOfStream",
            ServerPacket::ProfileInfo(_) => "ProfileInfo",
            ServerPacket::Totals(_) => "Totals",
            ServerPacket::Extremes(_) => "Extremes",
        }
    }
}
