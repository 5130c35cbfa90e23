use crate::codes::{ModifyActCode, PROGRESS};
use crate::cstrings::append_cstring;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::packet::{write_packet, Packet};
use memchr::memmem::Finder;
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::io::AsyncWrite;

/// Handle given to every [`Milter`](crate::Milter) callback.
///
/// It exposes the macros and headers received so far, read-only, and emits
/// modification requests straight onto the wire. Modification requests only
/// make sense between end-of-body and the terminal reply, i.e. from inside
/// [`Milter::body`](crate::Milter::body); the peer discards them elsewhere.
/// The borrow is scoped to the callback, so a modifier cannot be retained
/// past its return.
pub struct Modifier<'a> {
    macros: &'a HashMap<String, String>,
    headers: &'a HeaderMap,
    writer: &'a mut (dyn AsyncWrite + Unpin + Send),
}

impl<'a> Modifier<'a> {
    pub(crate) fn new(
        macros: &'a HashMap<String, String>,
        headers: &'a HeaderMap,
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> Self {
        Self {
            macros,
            headers,
            writer,
        }
    }

    /// Macro values most recently defined by the MTA.
    pub fn macros(&self) -> &HashMap<String, String> {
        self.macros
    }

    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.get(name).map(String::as_str)
    }

    /// Headers received so far for the current message.
    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    /// Append a recipient to the current message.
    pub async fn add_recipient(&mut self, rcpt: &str) -> Result<(), Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, &format!("<{rcpt}>"));
        self.send(ModifyActCode::AddRcpt as u8, payload).await
    }

    /// Remove a recipient from the current message.
    pub async fn delete_recipient(&mut self, rcpt: &str) -> Result<(), Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, &format!("<{rcpt}>"));
        self.send(ModifyActCode::DelRcpt as u8, payload).await
    }

    /// Replace the message body.
    pub async fn replace_body(&mut self, body: &[u8]) -> Result<(), Error> {
        let normalized;
        let body = match normalize_crlf(body) {
            Some(fixed) => {
                normalized = fixed;
                &normalized
            }
            None => body,
        };
        self.send(ModifyActCode::ReplBody as u8, body.to_vec()).await
    }

    /// Append a header to the message.
    pub async fn add_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, name);
        append_header_value(&mut payload, value);
        self.send(ModifyActCode::AddHeader as u8, payload).await
    }

    /// Replace the `index`-th header of the given name, counting from 1 in
    /// the order the headers were streamed. An empty value removes the
    /// header instead.
    pub async fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), Error> {
        let mut payload = index.to_be_bytes().to_vec();
        append_cstring(&mut payload, name);
        append_header_value(&mut payload, value);
        self.send(ModifyActCode::ChangeHeader as u8, payload).await
    }

    /// Insert a header before the `index`-th header of the given name,
    /// counting from 1.
    pub async fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), Error> {
        let mut payload = index.to_be_bytes().to_vec();
        append_cstring(&mut payload, name);
        append_header_value(&mut payload, value);
        self.send(ModifyActCode::InsertHeader as u8, payload).await
    }

    /// Replace the envelope sender, optionally with ESMTP arguments.
    pub async fn change_from(&mut self, from: &str, esmtp_args: &[&str]) -> Result<(), Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, from);
        for arg in esmtp_args {
            append_cstring(&mut payload, arg);
        }
        self.send(ModifyActCode::ChangeFrom as u8, payload).await
    }

    /// Quarantine the message with the given reason.
    pub async fn quarantine(&mut self, reason: &str) -> Result<(), Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, reason);
        self.send(ModifyActCode::Quarantine as u8, payload).await
    }

    /// Emit a progress notice so the peer extends its reply deadline while
    /// a long-running callback finishes.
    pub async fn progress(&mut self) -> Result<(), Error> {
        self.send(PROGRESS, Vec::new()).await
    }

    async fn send(&mut self, code: u8, payload: Vec<u8>) -> Result<(), Error> {
        write_packet(
            self.writer,
            &Packet::with_payload(code, payload),
            "modifier",
            None,
        )
        .await
    }
}

fn append_header_value(payload: &mut Vec<u8>, value: &str) {
    match normalize_crlf(value.as_bytes()) {
        Some(fixed) => {
            payload.extend_from_slice(&fixed);
            payload.push(0);
        }
        None => append_cstring(payload, value),
    }
}

// Postfix reads a CRLF pair here as a doubled CR; the line separator for
// this protocol is bare LF. Returns None when the input needs no rewrite.
fn normalize_crlf(data: &[u8]) -> Option<Vec<u8>> {
    static CRLF: LazyLock<Finder<'static>> = LazyLock::new(|| Finder::new(b"\r\n"));

    CRLF.find(data)?;

    let mut normalized = Vec::with_capacity(data.len());
    let mut last_idx = 0;
    for i in CRLF.find_iter(data) {
        normalized.extend_from_slice(&data[last_idx..i]);
        normalized.push(b'\n');
        last_idx = i + 2;
    }
    normalized.extend_from_slice(&data[last_idx..]);
    Some(normalized)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn crlf_normalization() {
        assert_eq!(normalize_crlf(b"plain value"), None);
        assert_eq!(normalize_crlf(b"bare\nnewline"), None);
        assert_eq!(normalize_crlf(b"a\r\nb").unwrap(), b"a\nb");
        assert_eq!(normalize_crlf(b"a\r\nb\r\n").unwrap(), b"a\nb\n");
        assert_eq!(normalize_crlf(b"\r\r\n").unwrap(), b"\r\n");
    }

    #[tokio::test]
    async fn change_header_payload_layout() {
        let macros = HashMap::new();
        let headers = HeaderMap::new();
        let mut wire = Cursor::new(Vec::new());
        let mut modifier = Modifier::new(&macros, &headers, &mut wire);
        modifier
            .change_header(1, "Subject", "***SPAM***")
            .await
            .unwrap();

        // frame length, code, u32 index, then name\0value\0
        let mut expected = (1u32 + 4 + 8 + 11).to_be_bytes().to_vec();
        expected.push(b'm');
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"Subject\0***SPAM***\0");
        assert_eq!(wire.into_inner(), expected);
    }

    #[tokio::test]
    async fn recipients_are_bracketed() {
        let macros = HashMap::new();
        let headers = HeaderMap::new();
        let mut wire = Cursor::new(Vec::new());
        let mut modifier = Modifier::new(&macros, &headers, &mut wire);
        modifier.add_recipient("to@example.org").await.unwrap();

        let wire = wire.into_inner();
        assert_eq!(wire[4], b'+');
        assert_eq!(&wire[5..], b"<to@example.org>\0");
    }
}
