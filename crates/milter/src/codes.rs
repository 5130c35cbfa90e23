use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Milter protocol version spoken by default. Peers advertising anything
/// below this are rejected during negotiation.
pub const PROTOCOL_VERSION: u32 = 2;

/// Highest protocol version this library understands. Version 6 adds the
/// skip action, change-from, and the per-command reply suppression bits.
pub const MAX_PROTOCOL_VERSION: u32 = 6;

/// Upper bound on a single body chunk payload.
pub const MAX_BODY_CHUNK: usize = 65535;

/// Progress frames may precede any terminal action and never conclude a turn.
pub(crate) const PROGRESS: u8 = b'p';

/// MTA to filter command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    OptNeg = b'O',       // SMFIC_OPTNEG
    Macro = b'D',        // SMFIC_MACRO
    Conn = b'C',         // SMFIC_CONNECT
    Helo = b'H',         // SMFIC_HELO
    Mail = b'M',         // SMFIC_MAIL
    Rcpt = b'R',         // SMFIC_RCPT
    Data = b'T',         // SMFIC_DATA
    Header = b'L',       // SMFIC_HEADER
    EndOfHeaders = b'N', // SMFIC_EOH
    Body = b'B',         // SMFIC_BODY
    EndOfBody = b'E',    // SMFIC_BODYEOB
    Abort = b'A',        // SMFIC_ABORT
    Quit = b'Q',         // SMFIC_QUIT
    QuitNewConn = b'K',  // SMFIC_QUIT_NC
}

impl TryFrom<u8> for Code {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            b'O' => Self::OptNeg,
            b'D' => Self::Macro,
            b'C' => Self::Conn,
            b'H' => Self::Helo,
            b'M' => Self::Mail,
            b'R' => Self::Rcpt,
            b'T' => Self::Data,
            b'L' => Self::Header,
            b'N' => Self::EndOfHeaders,
            b'B' => Self::Body,
            b'E' => Self::EndOfBody,
            b'A' => Self::Abort,
            b'Q' => Self::Quit,
            b'K' => Self::QuitNewConn,
            _ => return Err(byte),
        })
    }
}

/// Terminal reply codes sent by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionCode {
    Continue = b'c',  // SMFIR_CONTINUE
    Accept = b'a',    // SMFIR_ACCEPT
    Discard = b'd',   // SMFIR_DISCARD
    Reject = b'r',    // SMFIR_REJECT
    TempFail = b't',  // SMFIR_TEMPFAIL
    ReplyCode = b'y', // SMFIR_REPLYCODE
    Skip = b's',      // SMFIR_SKIP [v6]
}

impl TryFrom<u8> for ActionCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            b'c' => Self::Continue,
            b'a' => Self::Accept,
            b'd' => Self::Discard,
            b'r' => Self::Reject,
            b't' => Self::TempFail,
            b'y' => Self::ReplyCode,
            b's' => Self::Skip,
            _ => return Err(byte),
        })
    }
}

/// Message modification codes streamed by the filter between the client's
/// end-of-body and the terminal end-of-body reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModifyActCode {
    AddRcpt = b'+',      // SMFIR_ADDRCPT
    DelRcpt = b'-',      // SMFIR_DELRCPT
    ReplBody = b'b',     // SMFIR_REPLBODY
    AddHeader = b'h',    // SMFIR_ADDHEADER
    ChangeHeader = b'm', // SMFIR_CHGHEADER
    InsertHeader = b'i', // SMFIR_INSHEADER
    ChangeFrom = b'e',   // SMFIR_CHGFROM [v6]
    Quarantine = b'q',   // SMFIR_QUARANTINE
}

impl TryFrom<u8> for ModifyActCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            b'+' => Self::AddRcpt,
            b'-' => Self::DelRcpt,
            b'b' => Self::ReplBody,
            b'h' => Self::AddHeader,
            b'm' => Self::ChangeHeader,
            b'i' => Self::InsertHeader,
            b'e' => Self::ChangeFrom,
            b'q' => Self::Quarantine,
            _ => return Err(byte),
        })
    }
}

/// Protocol family byte carried in the connect payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtoFamily {
    Unknown = b'U', // SMFIA_UNKNOWN
    Unix = b'L',    // SMFIA_UNIX
    Inet = b'4',    // SMFIA_INET
    Inet6 = b'6',   // SMFIA_INET6
}

impl ProtoFamily {
    /// Network name handed to handler callbacks.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unix => "unix",
            Self::Inet => "tcp4",
            Self::Inet6 => "tcp6",
        }
    }
}

impl TryFrom<u8> for ProtoFamily {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            b'U' => Self::Unknown,
            b'L' => Self::Unix,
            b'4' => Self::Inet,
            b'6' => Self::Inet6,
            _ => return Err(byte),
        })
    }
}

bitflags! {
    /// Modify actions the filter wants permission to perform.
    /// Multiple options combine as a bitmask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OptAction: u32 {
        const ADD_HEADER = 1 << 0;    // SMFIF_ADDHDRS
        const CHANGE_BODY = 1 << 1;   // SMFIF_CHGBODY
        const ADD_RCPT = 1 << 2;      // SMFIF_ADDRCPT
        const REMOVE_RCPT = 1 << 3;   // SMFIF_DELRCPT
        const CHANGE_HEADER = 1 << 4; // SMFIF_CHGHDRS
        const QUARANTINE = 1 << 5;    // SMFIF_QUARANTINE

        // [v6]
        const CHANGE_FROM = 1 << 6;        // SMFIF_CHGFROM
        const ADD_RCPT_WITH_ARGS = 1 << 7; // SMFIF_ADDRCPT_PAR
        const SET_SYM_LIST = 1 << 8;       // SMFIF_SETSYMLIST
    }
}

bitflags! {
    /// Masks out unwanted parts of the SMTP transaction.
    /// Multiple options combine as a bitmask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OptProtocol: u32 {
        const NO_CONNECT = 1 << 0;   // SMFIP_NOCONNECT
        const NO_HELO = 1 << 1;      // SMFIP_NOHELO
        const NO_MAIL_FROM = 1 << 2; // SMFIP_NOMAIL
        const NO_RCPT_TO = 1 << 3;   // SMFIP_NORCPT
        const NO_BODY = 1 << 4;      // SMFIP_NOBODY
        const NO_HEADERS = 1 << 5;   // SMFIP_NOHDRS
        const NO_EOH = 1 << 6;       // SMFIP_NOEOH
        const NO_UNKNOWN = 1 << 8;   // SMFIP_NOUNKNOWN
        const NO_DATA = 1 << 9;      // SMFIP_NODATA

        /// [v6] MTA supports the skip action.
        const SKIP = 1 << 10; // SMFIP_SKIP
        /// [v6] Filter wants rejected recipients too.
        const RCPT_REJ = 1 << 11; // SMFIP_RCPT_REJ

        // The filter will not send an action reply for these MTA messages.
        const NO_HEADER_REPLY = 1 << 7; // SMFIP_NR_HDR
        // [v6]
        const NO_CONN_REPLY = 1 << 12;    // SMFIP_NR_CONN
        const NO_HELO_REPLY = 1 << 13;    // SMFIP_NR_HELO
        const NO_MAIL_REPLY = 1 << 14;    // SMFIP_NR_MAIL
        const NO_RCPT_REPLY = 1 << 15;    // SMFIP_NR_RCPT
        const NO_DATA_REPLY = 1 << 16;    // SMFIP_NR_DATA
        const NO_UNKNOWN_REPLY = 1 << 17; // SMFIP_NR_UNKN
        const NO_EOH_REPLY = 1 << 18;     // SMFIP_NR_EOH
        const NO_BODY_REPLY = 1 << 19;    // SMFIP_NR_BODY

        /// [v6]
        const HEADER_LEADING_SPACE = 1 << 20; // SMFIP_HDR_LEADSPC
    }
}

impl Default for OptAction {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for OptProtocol {
    fn default() -> Self {
        Self::empty()
    }
}

impl OptProtocol {
    /// Whether this mask suppresses sending `code` at all.
    pub fn suppresses_command(self, code: Code) -> bool {
        let bit = match code {
            Code::Conn => Self::NO_CONNECT,
            Code::Helo => Self::NO_HELO,
            Code::Mail => Self::NO_MAIL_FROM,
            Code::Rcpt => Self::NO_RCPT_TO,
            Code::Data => Self::NO_DATA,
            Code::Header => Self::NO_HEADERS,
            Code::EndOfHeaders => Self::NO_EOH,
            Code::Body => Self::NO_BODY,
            _ => return false,
        };
        self.contains(bit)
    }

    /// Whether this mask suppresses the reply to `code`. The end-of-body
    /// reply can never be suppressed.
    pub fn suppresses_reply(self, code: Code) -> bool {
        let bit = match code {
            Code::Conn => Self::NO_CONN_REPLY,
            Code::Helo => Self::NO_HELO_REPLY,
            Code::Mail => Self::NO_MAIL_REPLY,
            Code::Rcpt => Self::NO_RCPT_REPLY,
            Code::Data => Self::NO_DATA_REPLY,
            Code::Header => Self::NO_HEADER_REPLY,
            Code::EndOfHeaders => Self::NO_EOH_REPLY,
            Code::Body => Self::NO_BODY_REPLY,
            _ => return false,
        };
        self.contains(bit)
    }
}
