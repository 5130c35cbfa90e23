use crate::codes::MAX_BODY_CHUNK;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by milter sessions on either side of the protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure or unexpected end of stream.
    #[error("milter: {phase}: {source}")]
    Io {
        phase: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A frame operation outlived the session deadline.
    #[error("milter: {phase}: timed out after {duration:?}")]
    TimedOut {
        phase: &'static str,
        duration: Duration,
    },

    /// Malformed frame or payload, or a code the current state does not allow.
    #[error("milter: {phase}: {violation}")]
    Protocol {
        phase: &'static str,
        violation: ProtocolViolation,
    },

    /// The peer advertised a protocol version below the minimum.
    #[error("milter: negotiate: unsupported milter protocol version {0}")]
    UnsupportedVersion(u32),

    /// The caller handed over a body chunk larger than a frame permits.
    #[error("milter: body chunk: {0} bytes exceeds the {MAX_BODY_CHUNK} byte chunk limit")]
    TooBigBodyChunk(usize),

    /// Accept was observed after the server was shut down.
    #[error("milter: server closed")]
    ServerClosed,
}

impl Error {
    pub(crate) fn io(phase: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { phase, source }
    }

    pub(crate) fn proto(phase: &'static str, violation: ProtocolViolation) -> Self {
        Self::Protocol { phase, violation }
    }

    /// A clean end-of-stream, as opposed to a mid-frame failure, is how a
    /// peer that simply went away presents itself.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self,
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}

/// The specific way a peer strayed from the wire protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("zero-length frame")]
    EmptyFrame,

    #[error("unexpected code: {0:?}")]
    UnexpectedCode(char),

    #[error("unexpected data size: {0}")]
    DataSize(usize),

    #[error("malformed SMTP code: {0:?}")]
    MalformedSmtpCode(String),

    #[error("missing NUL delimiter")]
    MissingNul,
}
