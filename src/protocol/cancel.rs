use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::debug;

use super::{
    packet::{ClientPacket, ClientPacketKind},
    timer::RateLimit,
    transport::{PeekStream, ProtocolTransport, TransportError},
};

/// Cooperative cancellation flag shared with the execution engine.
///
/// Setting it never interrupts work in progress; the engine polls it between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a cancellation check found on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCheck {
    /// Nothing pending, or the check was not due yet.
    Idle,
    /// A Cancel packet was consumed.
    Cancelled,
    /// A Ping packet was consumed; the caller owes the client a Pong.
    Ping,
    /// Some other packet is pending. It was left unread.
    Unexpected(ClientPacketKind),
}

/// Rate-limited, non-blocking check for a Cancel or Ping sent while a query streams.
#[derive(Debug)]
pub struct CancellationMonitor {
    after_check_cancelled: RateLimit,
}

impl CancellationMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            after_check_cancelled: RateLimit::new(interval),
        }
    }

    /// Peeks the socket if the check interval has elapsed. Only Cancel and Ping packets are
    /// consumed; anything else stays in the stream.
    pub fn check<T: PeekStream>(
        &mut self,
        transport: &mut ProtocolTransport<T>,
    ) -> Result<CancelCheck, TransportError> {
        if !self.after_check_cancelled.due() {
            return Ok(CancelCheck::Idle);
        }

        let kind = match transport.peek_client_packet()? {
            None => return Ok(CancelCheck::Idle),
            Some(kind) => kind,
        };
        debug!("pending {} packet while streaming", kind.name());

        match kind {
            ClientPacketKind::Cancel | ClientPacketKind::Ping => {
                match transport.read_client_packet()? {
                    Some(ClientPacket::Cancel) => Ok(CancelCheck::Cancelled),
                    Some(ClientPacket::Ping) => Ok(CancelCheck::Ping),
                    Some(other) => Ok(CancelCheck::Unexpected(other.kind())),
                    None => Err(TransportError::Disconnected),
                }
            }
            other => Ok(CancelCheck::Unexpected(other)),
        }
    }
}
