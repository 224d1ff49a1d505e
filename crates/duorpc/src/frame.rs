//! # Frame Codec
//!
//! The transport envelope around every payload. Its shape is fixed so it can be
//! decoded before anything is known about the addressed service:
//!
//! ```text
//! client -> server   [ serviceId: u32, payload: bytes, sequence: u64? ]
//! server -> client   [ serviceId: u32, payload: bytes, sequence: u64?, succeeded: bool? ]
//! ```
//!
//! The tuple is written as a duopack list. An absent optional element in the
//! middle of the tuple is written as unit; absent trailing elements are omitted.
//!
//! ## Invariants
//! - **No partial frames**: a decode error carries nothing recovered from the
//!   input, so a caller cannot act on the service ID of a malformed frame.
//! - **Exact shape**: wrong element counts, wrong element types and trailing
//!   bytes are all rejected.

use duopack::Decoder;
use duopack::Encoder;
use duopack::ListIter;
use duopack::Tag;

use crate::catalog::ServiceId;

/// Envelope decoding and encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Truncated input, bad tag, or an element of the wrong type.
    Wire(duopack::Error),
    /// The envelope tuple has too few or too many elements.
    ElementCount { min: usize, max: usize, found: usize },
    /// Bytes remain after the envelope.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "malformed envelope: {}", e),
            Self::ElementCount { min, max, found } => {
                write!(f, "envelope has {} elements, expected {}..={}", found, min, max)
            }
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after envelope", n),
        }
    }
}

impl std::error::Error for Error {}

impl From<duopack::Error> for Error {
    fn from(e: duopack::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which side produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Input,
    /// Server to client.
    Output,
}

/// A client to server frame. The payload borrows from the received bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFrame<'a> {
    pub service_id: ServiceId,
    pub payload: &'a [u8],
    /// Present for API requests, absent for messages.
    pub sequence: Option<u64>,
}

/// A server to client frame. The payload borrows from the received bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame<'a> {
    pub service_id: ServiceId,
    pub payload: &'a [u8],
    /// Present for API responses, absent for pushed messages.
    pub sequence: Option<u64>,
    /// Present for API responses: `true` for success, `false` for an error body.
    pub succeeded: Option<bool>,
}

/// A decoded frame of either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Input(InputFrame<'a>),
    Output(OutputFrame<'a>),
}

/// Encodes a client to server frame.
pub fn encode_input(service_id: ServiceId, payload: &[u8], sequence: Option<u64>) -> Result<Vec<u8>> {
    let mut enc = Encoder::with_capacity(payload.len() + 32);
    enc.list_begin()?;
    enc.u32(service_id.0)?;
    enc.bytes(payload)?;
    if let Some(seq) = sequence {
        enc.u64(seq)?;
    }
    enc.list_end()?;
    Ok(enc.into_bytes()?)
}

/// Encodes a server to client frame.
pub fn encode_output(
    service_id: ServiceId,
    payload: &[u8],
    sequence: Option<u64>,
    succeeded: Option<bool>,
) -> Result<Vec<u8>> {
    let mut enc = Encoder::with_capacity(payload.len() + 32);
    enc.list_begin()?;
    enc.u32(service_id.0)?;
    enc.bytes(payload)?;
    match (sequence, succeeded) {
        (Some(seq), Some(ok)) => {
            enc.u64(seq)?;
            enc.bool(ok)?;
        }
        (Some(seq), None) => enc.u64(seq)?,
        (None, Some(ok)) => {
            enc.unit()?;
            enc.bool(ok)?;
        }
        (None, None) => {}
    }
    enc.list_end()?;
    Ok(enc.into_bytes()?)
}

/// Decodes a frame of the given direction.
pub fn decode(bytes: &[u8], direction: Direction) -> Result<Frame<'_>> {
    match direction {
        Direction::Input => decode_input(bytes).map(Frame::Input),
        Direction::Output => decode_output(bytes).map(Frame::Output),
    }
}

/// Decodes a client to server frame.
pub fn decode_input(bytes: &[u8]) -> Result<InputFrame<'_>> {
    let (mut items, service_id, payload) = open_envelope(bytes, 3)?;

    let sequence = match items.next()? {
        Some(mut dec) => optional_u64(&mut dec)?,
        None => None,
    };
    ensure_done(&mut items, 3)?;

    Ok(InputFrame { service_id, payload, sequence })
}

/// Decodes a server to client frame.
pub fn decode_output(bytes: &[u8]) -> Result<OutputFrame<'_>> {
    let (mut items, service_id, payload) = open_envelope(bytes, 4)?;

    let sequence = match items.next()? {
        Some(mut dec) => optional_u64(&mut dec)?,
        None => None,
    };
    let succeeded = match items.next()? {
        Some(mut dec) => Some(dec.bool()?),
        None => None,
    };
    ensure_done(&mut items, 4)?;

    Ok(OutputFrame { service_id, payload, sequence, succeeded })
}

/// Reads the list header and the two mandatory elements.
fn open_envelope(bytes: &[u8], max: usize) -> Result<(ListIter<'_>, ServiceId, &[u8])> {
    let mut dec = Decoder::new(bytes);
    let mut items = dec.list()?;
    if !dec.is_empty() {
        return Err(Error::TrailingBytes(dec.remaining()));
    }

    let mut first = items.next()?.ok_or(Error::ElementCount { min: 2, max, found: 0 })?;
    let service_id = ServiceId(first.u32()?);
    let mut second = items.next()?.ok_or(Error::ElementCount { min: 2, max, found: 1 })?;
    let payload = second.bytes()?;
    Ok((items, service_id, payload))
}

fn optional_u64(dec: &mut Decoder<'_>) -> Result<Option<u64>> {
    if dec.peek_tag()? == Tag::Unit {
        dec.unit()?;
        Ok(None)
    } else {
        Ok(Some(dec.u64()?))
    }
}

fn ensure_done(items: &mut ListIter<'_>, max: usize) -> Result<()> {
    let mut extra = 0;
    while items.next()?.is_some() {
        extra += 1;
    }
    if extra > 0 {
        return Err(Error::ElementCount { min: 2, max, found: max + extra });
    }
    Ok(())
}
