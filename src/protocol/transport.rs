use std::{
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
};
use log::trace;
use thiserror::Error;

use super::packet::{ClientPacket, ClientPacketKind, ServerPacket};

/// Upper bound on a single frame body. Also caps what decoding one packet may allocate.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_FRAME_SIZE>>;

const LENGTH_SIZE: usize = size_of::<u32>();
const TAG_SIZE: usize = size_of::<u32>();

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("unknown packet tag {0}")]
    UnknownPacket(u32),
    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,
    #[error("connection closed by peer")]
    Disconnected,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a non-blocking look at the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeked {
    /// Nothing has arrived yet.
    Pending,
    /// This many bytes are buffered and were copied without being consumed.
    Ready(usize),
    /// The peer closed its side.
    Closed,
}

/// A stream that can look at pending input without consuming it and without blocking.
pub trait PeekStream: Read + Write {
    fn try_peek(&mut self, buf: &mut [u8]) -> io::Result<Peeked>;
}

impl PeekStream for TcpStream {
    fn try_peek(&mut self, buf: &mut [u8]) -> io::Result<Peeked> {
        self.set_nonblocking(true)?;
        let res = self.peek(buf);
        self.set_nonblocking(false)?;

        match res {
            Ok(0) => Ok(Peeked::Closed),
            Ok(n) => Ok(Peeked::Ready(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Peeked::Pending),
            Err(e) => Err(e),
        }
    }
}

/// Length-prefixed packet framing over a byte stream.
///
/// Every packet travels as a frame: a big-endian `u32` body length followed by the bincode
/// encoding of the packet. With the fixed-int configuration the first four body bytes are the
/// packet's variant index, which lets [`peek_client_packet`](Self::peek_client_packet) learn
/// the kind of a pending packet without consuming it.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: WireConfig,
    max_frame_size: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_FRAME_SIZE>();
        Self {
            stream,
            config,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Lowers the frame size limit. Values above [`MAX_FRAME_SIZE`] are clamped.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// Encodes one packet into a complete frame.
    pub fn encode_frame<P: Encode>(&self, packet: &P) -> Result<Vec<u8>, TransportError> {
        let body = bincode::encode_to_vec(packet, self.config)?;
        if body.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Writes already encoded frames in a single write.
    pub fn write_frames(&mut self, frames: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frames)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_packet<P: Encode>(&mut self, packet: &P) -> Result<(), TransportError> {
        let frame = self.encode_frame(packet)?;
        trace!("writing frame of {} bytes", frame.len());
        self.write_frames(&frame)
    }

    /// Reads one packet. Returns `None` if the peer closed the stream cleanly at a frame
    /// boundary.
    pub fn read_packet<P: Decode<()>>(&mut self) -> Result<Option<P>, TransportError> {
        let mut len = [0u8; LENGTH_SIZE];
        let mut filled = 0;
        while filled < LENGTH_SIZE {
            match self.stream.read(&mut len[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(TransportError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let size = u32::from_be_bytes(len) as usize;
        if size > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; size];
        self.stream.read_exact(&mut body).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => TransportError::UnexpectedEof,
            _ => TransportError::Io(e),
        })?;
        trace!("read frame of {} bytes", LENGTH_SIZE + size);

        let (packet, read) = bincode::decode_from_slice(&body, self.config)?;
        if read != size {
            return Err(TransportError::TrailingBytes(size - read));
        }
        Ok(Some(packet))
    }

    pub fn write_client_packet(&mut self, packet: &ClientPacket) -> Result<(), TransportError> {
        self.write_packet(packet)
    }

    pub fn write_server_packet(&mut self, packet: &ServerPacket) -> Result<(), TransportError> {
        self.write_packet(packet)
    }

    pub fn read_client_packet(&mut self) -> Result<Option<ClientPacket>, TransportError> {
        self.read_packet()
    }

    pub fn read_server_packet(&mut self) -> Result<Option<ServerPacket>, TransportError> {
        self.read_packet()
    }
}

impl<T: PeekStream> ProtocolTransport<T> {
    /// Looks at the next client packet without consuming it or blocking.
    ///
    /// Returns `None` while the frame header has not fully arrived.
    pub fn peek_client_packet(&mut self) -> Result<Option<ClientPacketKind>, TransportError> {
        let mut header = [0u8; LENGTH_SIZE + TAG_SIZE];
        match self.stream.try_peek(&mut header)? {
            Peeked::Pending => Ok(None),
            Peeked::Ready(n) if n < header.len() => Ok(None),
            Peeked::Ready(_) => {
                let tag = frame_tag(&header).ok_or(TransportError::UnexpectedEof)?;
                ClientPacketKind::try_from(tag)
                    .map(Some)
                    .map_err(TransportError::UnknownPacket)
            }
            Peeked::Closed => Err(TransportError::Disconnected),
        }
    }
}

/// Variant index of the packet carried by an encoded frame.
pub(crate) fn frame_tag(frame: &[u8]) -> Option<u32> {
    let tag = frame.get(LENGTH_SIZE..LENGTH_SIZE + TAG_SIZE)?;
    Some(u32::from_be_bytes(tag.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;
    use crate::protocol::packet::{BlockPayload, Progress, QueryPacket};

    /// In-memory stream whose peek never blocks.
    struct PeekCursor(Cursor<Vec<u8>>);

    impl Read for PeekCursor {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for PeekCursor {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl PeekStream for PeekCursor {
        fn try_peek(&mut self, buf: &mut [u8]) -> io::Result<Peeked> {
            let pos = self.0.position() as usize;
            let data = &self.0.get_ref()[pos..];
            if data.is_empty() {
                return Ok(Peeked::Pending);
            }
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(Peeked::Ready(n))
        }
    }

    #[test]
    fn read_write_client_packet() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_client_packet(&ClientPacket::Ping).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let req = transport.read_client_packet().unwrap();
        assert_eq!(req, Some(ClientPacket::Ping));
    }

    #[test]
    fn read_write_server_packet() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let packet = ServerPacket::Progress(Progress { rows: 5, bytes: 40 });

        transport.write_server_packet(&packet).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let resp = transport.read_server_packet().unwrap();
        assert_eq!(resp, Some(packet));
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        assert!(transport.read_client_packet().unwrap().is_none());
    }

    #[test]
    fn eof_inside_frame_is_error() {
        let transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let frame = transport
            .encode_frame(&ClientPacket::Query(QueryPacket::default()))
            .unwrap();

        let mut truncated = ProtocolTransport::new(Cursor::new(frame[..frame.len() - 1].to_vec()));
        assert!(matches!(
            truncated.read_client_packet(),
            Err(TransportError::UnexpectedEof)
        ));

        let mut header_only = ProtocolTransport::new(Cursor::new(frame[..2].to_vec()));
        assert!(matches!(
            header_only.read_client_packet(),
            Err(TransportError::UnexpectedEof)
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let frame = transport
            .encode_frame(&ClientPacket::Data(BlockPayload(vec![0; 64])))
            .unwrap();

        let mut reader = ProtocolTransport::new(Cursor::new(frame)).with_max_frame_size(16);
        assert!(matches!(
            reader.read_client_packet(),
            Err(TransportError::FrameTooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn oversized_length_prefix_inside_frame_rejected() {
        // Data packet whose payload claims 2^40 bytes but carries none.
        let mut frame = 12u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&(ClientPacketKind::Data as u32).to_be_bytes());
        frame.extend_from_slice(&(1u64 << 40).to_be_bytes());

        let mut reader = ProtocolTransport::new(Cursor::new(frame));
        assert!(matches!(
            reader.read_client_packet(),
            Err(TransportError::Deserialize(
                bincode::error::DecodeError::LimitExceeded
            ))
        ));
    }

    #[test]
    fn frame_size_is_clamped() {
        let transport =
            ProtocolTransport::new(Cursor::new(Vec::new())).with_max_frame_size(usize::MAX);
        assert_eq!(transport.max_frame_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn frame_tag_matches_packet_kind() {
        let transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let packets = [
            ClientPacket::Query(QueryPacket::default()),
            ClientPacket::Data(BlockPayload(vec![1, 2, 3])),
            ClientPacket::Cancel,
            ClientPacket::Ping,
        ];

        for packet in packets {
            let frame = transport.encode_frame(&packet).unwrap();
            let tag = frame_tag(&frame).unwrap();
            assert_eq!(ClientPacketKind::try_from(tag), Ok(packet.kind()));
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let writer = ProtocolTransport::new(Cursor::new(Vec::new()));
        let mut bytes = writer.encode_frame(&ClientPacket::Cancel).unwrap();
        bytes.extend(writer.encode_frame(&ClientPacket::Ping).unwrap());

        let mut transport = ProtocolTransport::new(PeekCursor(Cursor::new(bytes)));
        assert_eq!(
            transport.peek_client_packet().unwrap(),
            Some(ClientPacketKind::Cancel)
        );
        assert_eq!(
            transport.read_client_packet().unwrap(),
            Some(ClientPacket::Cancel)
        );
        assert_eq!(
            transport.peek_client_packet().unwrap(),
            Some(ClientPacketKind::Ping)
        );
        assert_eq!(
            transport.read_client_packet().unwrap(),
            Some(ClientPacket::Ping)
        );
        assert_eq!(transport.peek_client_packet().unwrap(), None);
    }

    #[test]
    fn peek_partial_header_is_pending() {
        let writer = ProtocolTransport::new(Cursor::new(Vec::new()));
        let frame = writer.encode_frame(&ClientPacket::Cancel).unwrap();

        let mut transport = ProtocolTransport::new(PeekCursor(Cursor::new(frame[..5].to_vec())));
        assert_eq!(transport.peek_client_packet().unwrap(), None);
    }
}
