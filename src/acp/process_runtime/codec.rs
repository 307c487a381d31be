//! NDJSON codec for process-backed ACP runtime streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum
//! line length to prevent memory exhaustion caused by an unterminated or
//! maliciously large message from a misbehaving agent process.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::errors::AcpErrorCode;
use crate::{AppError, Result};

/// Maximum line length accepted by the process-runtime codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec for bidirectional process-backed runtime streams. Each
/// newline-terminated (`\n`) UTF-8 string is one complete message.
#[derive(Debug)]
pub struct NdjsonCodec(LinesCodec);

impl NdjsonCodec {
    /// Create a new codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => AppError::acp(
            AcpErrorCode::TurnFailed,
            format!("line too long: exceeded {MAX_LINE_BYTES} bytes"),
        ),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
