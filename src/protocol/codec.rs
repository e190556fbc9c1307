//! Block streaming adapters.
//!
//! [`BlockInput`] and [`BlockOutput`] sit between the session and the wire. They turn blocks
//! into Data payloads and back, wrapping the bytes in a zlib stream when the query negotiated
//! compression. This is the only place that knows about the block binary layout; the rest of
//! the session only sees [`Block`]s and opaque [`BlockPayload`]s.
use std::io::{self, Read, Write};

use bincode::config::{BigEndian, Configuration, Fixint, Limit};
use flate2::{Compression as Level, read::ZlibDecoder, write::ZlibEncoder};
use thiserror::Error;

use crate::block::Block;

use super::packet::{BlockPayload, Compression};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode block: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode block: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("compression stream error: {0}")]
    Io(#[from] io::Error),
    #[error("block payload has trailing bytes")]
    TrailingBytes,
}

/// Upper bound on the decoded size of one block, compressed or not.
pub const MAX_DECODED_BLOCK_BYTES: usize = 256 * 1024 * 1024;

type BlockConfig = Configuration<BigEndian, Fixint, Limit<MAX_DECODED_BLOCK_BYTES>>;

fn config() -> BlockConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_DECODED_BLOCK_BYTES>()
}

/// Sink that is either a plain buffer or a compressing one.
pub enum MaybeCompressedWriter {
    Plain(Vec<u8>),
    Compressed(ZlibEncoder<Vec<u8>>),
}

impl MaybeCompressedWriter {
    pub fn new(compression: Compression) -> Self {
        match compression {
            Compression::Disable => MaybeCompressedWriter::Plain(Vec::new()),
            Compression::Enable => {
                MaybeCompressedWriter::Compressed(ZlibEncoder::new(Vec::new(), Level::fast()))
            }
        }
    }

    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            MaybeCompressedWriter::Plain(buf) => Ok(buf),
            MaybeCompressedWriter::Compressed(encoder) => encoder.finish(),
        }
    }
}

impl Write for MaybeCompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MaybeCompressedWriter::Plain(inner) => inner.write(buf),
            MaybeCompressedWriter::Compressed(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MaybeCompressedWriter::Plain(inner) => inner.flush(),
            MaybeCompressedWriter::Compressed(inner) => inner.flush(),
        }
    }
}

/// Decodes blocks received in Data packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInput {
    compression: Compression,
}

impl BlockInput {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn read(&self, payload: &BlockPayload) -> Result<Block, CodecError> {
        match self.compression {
            Compression::Disable => {
                let (block, read) = bincode::decode_from_slice(&payload.0, config())?;
                if read != payload.0.len() {
                    return Err(CodecError::TrailingBytes);
                }
                Ok(block)
            }
            Compression::Enable => {
                let mut decoder = ZlibDecoder::new(payload.0.as_slice());
                let block = bincode::decode_from_std_read(&mut decoder, config())?;
                let mut rest = [0u8; 1];
                if decoder.read(&mut rest)? != 0 {
                    return Err(CodecError::TrailingBytes);
                }
                Ok(block)
            }
        }
    }
}

/// Encodes blocks for Data, Totals and Extremes packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockOutput {
    compression: Compression,
}

impl BlockOutput {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn write(&self, block: &Block) -> Result<BlockPayload, CodecError> {
        let mut out = MaybeCompressedWriter::new(self.compression);
        bincode::encode_into_std_write(block, &mut out, config())?;
        Ok(BlockPayload(out.finish()?))
    }
}
