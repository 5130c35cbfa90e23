use crate::error::{Error, ProtocolViolation};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// A single length-prefixed protocol frame: one code byte and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(code: u8) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(code: u8, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }
}

/// Read one frame. A deadline of `None` or zero leaves the read unbounded;
/// the deadline applies to the whole frame, not each underlying read.
pub(crate) async fn read_packet<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    phase: &'static str,
    deadline: Option<Duration>,
) -> Result<Packet, Error> {
    match deadline {
        Some(limit) if !limit.is_zero() => {
            match timeout(limit, read_packet_inner(reader, phase)).await {
                Ok(result) => result,
                Err(_) => Err(Error::TimedOut {
                    phase,
                    duration: limit,
                }),
            }
        }
        _ => read_packet_inner(reader, phase).await,
    }
}

async fn read_packet_inner<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    phase: &'static str,
) -> Result<Packet, Error> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length).await.map_err(Error::io(phase))?;
    let length = u32::from_be_bytes(length);
    if length == 0 {
        return Err(Error::proto(phase, ProtocolViolation::EmptyFrame));
    }

    let mut data = vec![0u8; length as usize];
    reader.read_exact(&mut data).await.map_err(Error::io(phase))?;

    let payload = data.split_off(1);
    tracing::trace!(
        "recv frame {:?} with {} byte payload",
        data[0] as char,
        payload.len()
    );
    Ok(Packet {
        code: data[0],
        payload,
    })
}

/// Write one frame. The length prefix, code, and payload are assembled into
/// a single buffer so they leave in one network write where possible.
pub(crate) async fn write_packet<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    packet: &Packet,
    phase: &'static str,
    deadline: Option<Duration>,
) -> Result<(), Error> {
    match deadline {
        Some(limit) if !limit.is_zero() => {
            match timeout(limit, write_packet_inner(writer, packet, phase)).await {
                Ok(result) => result,
                Err(_) => Err(Error::TimedOut {
                    phase,
                    duration: limit,
                }),
            }
        }
        _ => write_packet_inner(writer, packet, phase).await,
    }
}

async fn write_packet_inner<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    packet: &Packet,
    phase: &'static str,
) -> Result<(), Error> {
    let mut frame = Vec::with_capacity(4 + 1 + packet.payload.len());
    frame.extend_from_slice(&(packet.payload.len() as u32 + 1).to_be_bytes());
    frame.push(packet.code);
    frame.extend_from_slice(&packet.payload);

    tracing::trace!(
        "send frame {:?} with {} byte payload",
        packet.code as char,
        packet.payload.len()
    );
    writer.write_all(&frame).await.map_err(Error::io(phase))?;
    writer.flush().await.map_err(Error::io(phase))
}

/// Callers must have checked that at least four bytes are present.
pub(crate) fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}
