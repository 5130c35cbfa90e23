use crate::codes::{ActionCode, ModifyActCode, OptAction, OptProtocol, PROTOCOL_VERSION};
use crate::cstrings::{decode_cstrings, read_cstring};
use crate::error::{Error, ProtocolViolation};
use crate::packet::{read_u32, Packet};
use memchr::memchr;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side session configuration: the masks offered during negotiation
/// and the per-frame deadlines. A zero deadline leaves that direction
/// unbounded.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Modify actions offered to the filter.
    #[serde(default)]
    pub action_mask: OptAction,

    /// Protocol suppressions offered to the filter.
    #[serde(default)]
    pub protocol_mask: OptProtocol,

    /// Version offered during negotiation: 2 by default, 6 to advertise the
    /// v6 feature bits.
    #[serde(default = "ClientOptions::default_protocol_version")]
    pub protocol_version: u32,

    #[serde(default = "ClientOptions::default_read_timeout")]
    pub read_timeout: Duration,

    #[serde(default = "ClientOptions::default_write_timeout")]
    pub write_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            action_mask: OptAction::empty(),
            protocol_mask: OptProtocol::empty(),
            protocol_version: Self::default_protocol_version(),
            read_timeout: Self::default_read_timeout(),
            write_timeout: Self::default_write_timeout(),
        }
    }
}

impl ClientOptions {
    fn default_protocol_version() -> u32 {
        PROTOCOL_VERSION
    }
    fn default_read_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_write_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

/// Terminal reply to a single client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub code: ActionCode,

    /// SMTP status when `code` is [`ActionCode::ReplyCode`].
    pub smtp_code: u16,
    /// Reply text when `code` is [`ActionCode::ReplyCode`].
    pub smtp_text: String,
}

impl Action {
    pub fn is_continue(&self) -> bool {
        self.code == ActionCode::Continue
    }

    /// Stand-in reply for a command that negotiation says not to send or
    /// not to wait on, so call sites never have to branch.
    pub(crate) fn synthetic_continue() -> Self {
        Self {
            code: ActionCode::Continue,
            smtp_code: 0,
            smtp_text: String::new(),
        }
    }
}

pub(crate) fn parse_action(msg: &Packet, phase: &'static str) -> Result<Action, Error> {
    let code = ActionCode::try_from(msg.code)
        .map_err(|byte| Error::proto(phase, ProtocolViolation::UnexpectedCode(byte as char)))?;

    let mut action = Action {
        code,
        smtp_code: 0,
        smtp_text: String::new(),
    };
    if code == ActionCode::ReplyCode {
        // CCC SMSG\0 with a single space at byte 3.
        if msg.payload.len() <= 4 {
            return Err(Error::proto(
                phase,
                ProtocolViolation::DataSize(msg.payload.len()),
            ));
        }
        action.smtp_code = std::str::from_utf8(&msg.payload[..3])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| {
                Error::proto(
                    phase,
                    ProtocolViolation::MalformedSmtpCode(
                        String::from_utf8_lossy(&msg.payload[..3]).into_owned(),
                    ),
                )
            })?;
        action.smtp_text = read_cstring(&msg.payload[4..]);
    }

    Ok(action)
}

/// Message modification requested by the filter, streamed between the
/// client's end-of-body and the terminal end-of-body reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyAction {
    AddRcpt {
        rcpt: String,
    },
    DelRcpt {
        rcpt: String,
    },
    /// Replacement for the entire message body.
    ReplaceBody {
        body: Vec<u8>,
    },
    AddHeader {
        name: String,
        value: String,
    },
    /// `index` is 1-based and counts only headers named `name`, in the
    /// order they were streamed. An empty value means "remove".
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    ChangeFrom {
        from: String,
        args: Vec<String>,
    },
    Quarantine {
        reason: String,
    },
}

pub(crate) fn parse_modify_action(msg: &Packet, phase: &'static str) -> Result<ModifyAction, Error> {
    let code = ModifyActCode::try_from(msg.code)
        .map_err(|byte| Error::proto(phase, ProtocolViolation::UnexpectedCode(byte as char)))?;

    Ok(match code {
        ModifyActCode::AddRcpt => ModifyAction::AddRcpt {
            rcpt: read_cstring(&msg.payload),
        },
        ModifyActCode::DelRcpt => ModifyAction::DelRcpt {
            rcpt: read_cstring(&msg.payload),
        },
        ModifyActCode::Quarantine => ModifyAction::Quarantine {
            reason: read_cstring(&msg.payload),
        },
        ModifyActCode::ReplBody => ModifyAction::ReplaceBody {
            body: msg.payload.clone(),
        },
        ModifyActCode::ChangeFrom => {
            let mut fields = decode_cstrings(&msg.payload).into_iter();
            let from = fields.next().unwrap_or_default();
            ModifyAction::ChangeFrom {
                from,
                args: fields.collect(),
            }
        }
        ModifyActCode::ChangeHeader | ModifyActCode::InsertHeader => {
            if msg.payload.len() < 4 {
                return Err(Error::proto(
                    phase,
                    ProtocolViolation::DataSize(msg.payload.len()),
                ));
            }
            let index = read_u32(&msg.payload);
            let (name, value) = parse_header_pair(&msg.payload[4..], phase)?;
            match code {
                ModifyActCode::ChangeHeader => ModifyAction::ChangeHeader { index, name, value },
                _ => ModifyAction::InsertHeader { index, name, value },
            }
        }
        ModifyActCode::AddHeader => {
            let (name, value) = parse_header_pair(&msg.payload, phase)?;
            ModifyAction::AddHeader { name, value }
        }
    })
}

fn parse_header_pair(data: &[u8], phase: &'static str) -> Result<(String, String), Error> {
    let nul = memchr(0, data).ok_or_else(|| Error::proto(phase, ProtocolViolation::MissingNul))?;
    let name = String::from_utf8_lossy(&data[..nul]).into_owned();
    let value = read_cstring(&data[nul + 1..]);
    Ok((name, value))
}
