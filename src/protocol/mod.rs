//! Native client-server protocol.
//!
//! This module implements the server side of the native TCP protocol: a per-connection
//! session that performs the handshake, receives queries, streams inserted data into the
//! engine and streams result blocks back, interleaving progress reports and watching for
//! cancellation. It also provides a small blocking [`Client`] for the same protocol.
//!
//! # Overview
//!
//! A connection carries one query at a time. The client sends a Query packet, optionally
//! followed by Data packets for an insert, and the server answers with Data, Progress,
//! ProfileInfo, Totals and Extremes packets and finally EndOfStream. A query that fails is
//! answered with a single Exception packet instead of EndOfStream, and the connection stays
//! open for the next query.
//!
//! While a result streams the server never blocks on the client. It peeks the socket at a
//! bounded rate and only consumes Cancel and Ping packets.
//!
//! # Key Components
//!
//! - [`ConnectionSession`]: drives one connection through handshake and queries.
//! - [`ProtocolTransport`]: length-prefixed packet framing over a byte stream.
//! - [`BlockInput`](codec::BlockInput) / [`BlockOutput`](codec::BlockOutput): block codec
//!   with optional compression.
//! - [`ProgressTracker`]: lock-free progress counters shared with engine workers.
//! - [`CancellationMonitor`](cancel::CancellationMonitor): rate-limited non-blocking cancel check.
//! - [`Server`]: accept loop running sessions on a worker pool.
//!
//! # Binary Format
//!
//! - Each packet is a frame: a big-endian `u32` body length, then the body.
//! - The body is the bincode encoding of the packet with fixed-width big-endian integers, so
//!   its first four bytes are the packet tag.
//! - Data, Totals and Extremes bodies carry an encoded block, zlib-compressed when the query
//!   asked for compression.
//!
//! # See Also
//!
//! - [`engine`](crate::engine): what the session hands queries to.
pub mod cancel;
pub mod client;
pub mod codec;
pub mod packet;
pub mod progress;
pub mod server;
pub mod session;
pub mod state;
pub mod thread;
pub mod timer;
pub mod transport;

pub use cancel::CancellationToken;
pub use client::{Client, ClientError, QueryResult};
pub use packet::{
    ClientPacket, Compression, ProfileInfo, Progress, QueryPacket, SERVER_NAME, ServerPacket,
    Stage,
};
pub use progress::ProgressTracker;
pub use server::{Server, ShutdownHandle};
pub use session::ConnectionSession;
pub use thread::ThreadPool;
pub use transport::ProtocolTransport;
