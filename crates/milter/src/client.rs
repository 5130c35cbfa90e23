use crate::client_types::{parse_action, parse_modify_action, Action, ClientOptions, ModifyAction};
use crate::codes::{
    ActionCode, Code, ModifyActCode, OptAction, OptProtocol, ProtoFamily, MAX_BODY_CHUNK,
    PROGRESS, PROTOCOL_VERSION,
};
use crate::cstrings::append_cstring;
use crate::error::{Error, ProtocolViolation};
use crate::packet::{read_packet, read_u32, write_packet, Packet};
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// MTA-side entry point: holds the masks and deadlines to use when opening
/// milter sessions.
#[derive(Debug, Clone, Default)]
pub struct Client {
    options: ClientOptions,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ClientOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Dial a filter over TCP and negotiate a session.
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<ClientSession, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(Error::io("session create"))?;
        // No need for Nagle with turn-based request/response
        stream.set_nodelay(true).map_err(Error::io("session create"))?;
        self.session(stream).await
    }

    /// Negotiate a session over an already-established transport.
    pub async fn session<S: AsyncReadAndWrite + 'static>(
        &self,
        stream: S,
    ) -> Result<ClientSession, Error> {
        let mut session = ClientSession {
            socket: Box::new(stream),
            actions: self.options.action_mask,
            protocol: self.options.protocol_mask,
            needs_abort: false,
            read_timeout: self.options.read_timeout,
            write_timeout: self.options.write_timeout,
        };
        session.negotiate(&self.options).await?;
        Ok(session)
    }
}

/// One negotiated milter session.
///
/// A session outlives a single message: after [`ClientSession::end`] (or
/// [`ClientSession::abort`]) the same session checks the next message that
/// arrives on the same SMTP connection; connection and HELO information are
/// preserved on the filter side. [`ClientSession::close`] concludes it.
#[derive(Debug)]
pub struct ClientSession {
    socket: BoxedAsyncReadAndWrite,
    actions: OptAction,
    protocol: OptProtocol,

    needs_abort: bool,

    read_timeout: Duration,
    write_timeout: Duration,
}

impl ClientSession {
    /// Exchange OPTNEG offers and keep the common subset of both masks.
    async fn negotiate(&mut self, options: &ClientOptions) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(4 * 3);
        payload.extend_from_slice(&options.protocol_version.to_be_bytes());
        payload.extend_from_slice(&options.action_mask.bits().to_be_bytes());
        payload.extend_from_slice(&options.protocol_mask.bits().to_be_bytes());
        self.write(&Packet::with_payload(Code::OptNeg as u8, payload), "negotiate")
            .await?;

        let msg = read_packet(&mut self.socket, "negotiate", Some(self.read_timeout)).await?;
        if msg.code != Code::OptNeg as u8 {
            return Err(Error::proto(
                "negotiate",
                ProtocolViolation::UnexpectedCode(msg.code as char),
            ));
        }
        if msg.payload.len() < 4 * 3 {
            return Err(Error::proto(
                "negotiate",
                ProtocolViolation::DataSize(msg.payload.len()),
            ));
        }

        let filter_version = read_u32(&msg.payload);
        // Not a strict comparison; a filter speaking a newer protocol still
        // negotiates meaningful masks.
        if filter_version < PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(filter_version));
        }

        // AND with our own offer in case the filter did not.
        self.actions &= OptAction::from_bits_retain(read_u32(&msg.payload[4..]));
        self.protocol &= OptProtocol::from_bits_retain(read_u32(&msg.payload[8..]));

        self.needs_abort = true;
        Ok(())
    }

    /// The modify actions both peers agreed on.
    pub fn action_mask(&self) -> OptAction {
        self.actions
    }

    /// The protocol suppressions both peers agreed on.
    pub fn protocol_mask(&self) -> OptProtocol {
        self.protocol
    }

    /// Define macros for the command whose code is given. The set stays in
    /// effect until the filter resets message state. No reply is expected.
    pub async fn macros(&mut self, code: Code, pairs: &[(&str, &str)]) -> Result<(), Error> {
        let mut payload = vec![code as u8];
        for (name, value) in pairs {
            append_cstring(&mut payload, name);
            append_cstring(&mut payload, value);
        }
        self.write(&Packet::with_payload(Code::Macro as u8, payload), "macros")
            .await
    }

    /// Send the SMTP connection information. Call once per session.
    pub async fn conn(
        &mut self,
        hostname: &str,
        family: ProtoFamily,
        port: u16,
        addr: &str,
    ) -> Result<Action, Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, hostname);
        payload.push(family as u8);
        if family != ProtoFamily::Unknown {
            if matches!(family, ProtoFamily::Inet | ProtoFamily::Inet6) {
                payload.extend_from_slice(&port.to_be_bytes());
            }
            append_cstring(&mut payload, addr);
        }
        self.send_command(Code::Conn, payload, "conn").await
    }

    /// Send the HELO/EHLO hostname. Call once per session.
    pub async fn helo(&mut self, helo: &str) -> Result<Action, Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, helo);
        self.send_command(Code::Helo, payload, "helo").await
    }

    /// Send the envelope sender, opening a new message.
    pub async fn mail(&mut self, sender: &str, esmtp_args: &[&str]) -> Result<Action, Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, &format!("<{sender}>"));
        for arg in esmtp_args {
            append_cstring(&mut payload, arg);
        }
        self.send_command(Code::Mail, payload, "mail").await
    }

    /// Send one envelope recipient.
    pub async fn rcpt(&mut self, rcpt: &str, esmtp_args: &[&str]) -> Result<Action, Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, &format!("<{rcpt}>"));
        for arg in esmtp_args {
            append_cstring(&mut payload, arg);
        }
        self.send_command(Code::Rcpt, payload, "rcpt").await
    }

    /// Send a single header field. [`ClientSession::header_end`] must follow
    /// the last field.
    pub async fn header_field(&mut self, key: &str, value: &str) -> Result<Action, Error> {
        let mut payload = Vec::new();
        append_cstring(&mut payload, key);
        append_cstring(&mut payload, value);
        self.send_command(Code::Header, payload, "header field").await
    }

    /// Signal the end of headers. No header fields may follow.
    pub async fn header_end(&mut self) -> Result<Action, Error> {
        self.send_command(Code::EndOfHeaders, Vec::new(), "header end")
            .await
    }

    /// Stream a whole header collection followed by end-of-headers, stopping
    /// early on the first non-continue action.
    pub async fn headers<I, K, V>(&mut self, fields: I) -> Result<Action, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in fields {
            let action = self.header_field(key.as_ref(), value.as_ref()).await?;
            if !action.is_continue() {
                return Ok(action);
            }
        }
        self.header_end().await
    }

    /// Send a single body chunk of at most [`MAX_BODY_CHUNK`] bytes. Larger
    /// chunks fail without touching the wire; use
    /// [`ClientSession::body_read_from`] to have the splitting done for you.
    pub async fn body_chunk(&mut self, chunk: &[u8]) -> Result<Action, Error> {
        if self.protocol.suppresses_command(Code::Body) {
            return Ok(Action::synthetic_continue());
        }
        if chunk.len() > MAX_BODY_CHUNK {
            return Err(Error::TooBigBodyChunk(chunk.len()));
        }
        self.send_command(Code::Body, chunk.to_vec(), "body chunk")
            .await
    }

    /// Stream the entire body from `reader` in maximum-size chunks, then
    /// conclude the message with [`ClientSession::end`].
    ///
    /// A `skip` action stops the chunking but the message is still
    /// concluded; any other non-continue action is returned as-is without
    /// sending end-of-body.
    pub async fn body_read_from<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
    ) -> Result<(Vec<ModifyAction>, Action), Error> {
        let mut buf = vec![0u8; MAX_BODY_CHUNK];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(Error::io("body chunk"))?;
            if n == 0 {
                break;
            }

            let action = self.body_chunk(&buf[..n]).await?;
            match action.code {
                ActionCode::Continue => {}
                // The filter has seen enough body but still wants the
                // end-of-body exchange.
                ActionCode::Skip => break,
                _ => return Ok((Vec::new(), action)),
            }
        }
        self.end().await
    }

    /// Send end-of-body and collect the filter's modification requests along
    /// with the terminal action. Afterwards the session is back in the state
    /// before [`ClientSession::mail`] and can check another message.
    pub async fn end(&mut self) -> Result<(Vec<ModifyAction>, Action), Error> {
        self.write(&Packet::new(Code::EndOfBody as u8), "end").await?;
        self.read_modify_actions("end").await
    }

    /// Abort the current message, resetting the session to the state before
    /// [`ClientSession::mail`]. Connection and HELO state are preserved.
    pub async fn abort(&mut self) -> Result<(), Error> {
        self.write(&Packet::new(Code::Abort as u8), "abort").await
    }

    /// Conclude the session and drop the transport. An in-progress message
    /// sequence is aborted first.
    pub async fn close(mut self) -> Result<(), Error> {
        if self.needs_abort {
            // Best effort; the quit below is what must land.
            let _ = self.write(&Packet::new(Code::Abort as u8), "close").await;
        }
        self.write(&Packet::new(Code::Quit as u8), "close").await
    }

    /// Send a command honoring the negotiated suppression bits: a command
    /// the filter opted out of is not sent at all, one whose reply is
    /// suppressed is sent without waiting, and either way the caller sees a
    /// synthesized `continue`.
    async fn send_command(
        &mut self,
        code: Code,
        payload: Vec<u8>,
        phase: &'static str,
    ) -> Result<Action, Error> {
        if self.protocol.suppresses_command(code) {
            return Ok(Action::synthetic_continue());
        }

        self.write(&Packet::with_payload(code as u8, payload), phase)
            .await?;

        if self.protocol.suppresses_reply(code) {
            return Ok(Action::synthetic_continue());
        }
        self.read_action(phase).await
    }

    async fn write(&mut self, packet: &Packet, phase: &'static str) -> Result<(), Error> {
        write_packet(&mut self.socket, packet, phase, Some(self.write_timeout)).await
    }

    /// Read frames until a terminal action arrives, skipping progress
    /// notices. Any terminal other than `continue` means the filter has
    /// given its verdict and no abort is owed on close.
    async fn read_action(&mut self, phase: &'static str) -> Result<Action, Error> {
        loop {
            let msg = read_packet(&mut self.socket, phase, Some(self.read_timeout)).await?;
            if msg.code == PROGRESS {
                continue;
            }
            if msg.code != ActionCode::Continue as u8 {
                self.needs_abort = false;
            }
            return parse_action(&msg, phase);
        }
    }

    /// Collect modify actions until the terminal end-of-body action shows
    /// up, skipping progress notices.
    async fn read_modify_actions(
        &mut self,
        phase: &'static str,
    ) -> Result<(Vec<ModifyAction>, Action), Error> {
        let mut modifications = Vec::new();
        loop {
            let msg = read_packet(&mut self.socket, phase, Some(self.read_timeout)).await?;
            if msg.code == PROGRESS {
                continue;
            }
            if ModifyActCode::try_from(msg.code).is_ok() {
                modifications.push(parse_modify_action(&msg, phase)?);
            } else {
                let action = parse_action(&msg, phase)?;
                return Ok((modifications, action));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::headers::HeaderMap;
    use crate::modifier::Modifier;
    use crate::server::{Milter, NoOpMilter, Response, Server};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct Recorded {
        host: String,
        family: String,
        port: u16,
        addr: Option<IpAddr>,
        helo: String,
        from: String,
        rcpts: Vec<String>,
        headers: HeaderMap,
        chunks: Vec<Vec<u8>>,
        macros_at_helo: HashMap<String, String>,
        macros_at_abort: Option<HashMap<String, String>>,
    }

    #[derive(Clone)]
    struct TestMilter {
        state: Arc<Mutex<Recorded>>,
        helo_response: Response,
        mail_response: Response,
        chunk_response: Response,
        emit_modifications: bool,
        emit_body_rewrite: bool,
    }

    impl TestMilter {
        fn new(state: Arc<Mutex<Recorded>>) -> Self {
            Self {
                state,
                helo_response: Response::Continue,
                mail_response: Response::Continue,
                chunk_response: Response::Continue,
                emit_modifications: false,
                emit_body_rewrite: false,
            }
        }
    }

    #[async_trait]
    impl Milter for TestMilter {
        async fn connect(
            &mut self,
            host: &str,
            family: &str,
            port: u16,
            addr: Option<IpAddr>,
            _m: &mut Modifier<'_>,
        ) -> anyhow::Result<Response> {
            let mut state = self.state.lock().unwrap();
            state.host = host.to_string();
            state.family = family.to_string();
            state.port = port;
            state.addr = addr;
            Ok(Response::Continue)
        }

        async fn helo(&mut self, name: &str, m: &mut Modifier<'_>) -> anyhow::Result<Response> {
            let mut state = self.state.lock().unwrap();
            state.helo = name.to_string();
            state.macros_at_helo = m.macros().clone();
            Ok(self.helo_response.clone())
        }

        async fn mail_from(&mut self, from: &str, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
            self.state.lock().unwrap().from = from.to_string();
            Ok(self.mail_response.clone())
        }

        async fn rcpt_to(&mut self, rcpt: &str, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
            self.state.lock().unwrap().rcpts.push(rcpt.to_string());
            Ok(Response::Continue)
        }

        async fn headers(
            &mut self,
            headers: &HeaderMap,
            _m: &mut Modifier<'_>,
        ) -> anyhow::Result<Response> {
            self.state.lock().unwrap().headers = headers.clone();
            Ok(Response::Continue)
        }

        async fn body_chunk(
            &mut self,
            chunk: &[u8],
            _m: &mut Modifier<'_>,
        ) -> anyhow::Result<Response> {
            self.state.lock().unwrap().chunks.push(chunk.to_vec());
            Ok(self.chunk_response.clone())
        }

        async fn body(&mut self, m: &mut Modifier<'_>) -> anyhow::Result<Response> {
            if self.emit_modifications {
                m.add_header("X-Bad", "very").await?;
                m.change_header(1, "Subject", "***SPAM***").await?;
                m.quarantine("very bad message").await?;
            }
            if self.emit_body_rewrite {
                m.progress().await?;
                m.insert_header(2, "X-Inserted", "here").await?;
                m.delete_recipient("to1@example.org").await?;
                m.replace_body(b"rewritten\r\nbody").await?;
                m.change_from("other@example.org", &["A=B"]).await?;
                return Ok(Response::Accept);
            }
            Ok(Response::Continue)
        }

        async fn abort(&mut self, m: &mut Modifier<'_>) -> anyhow::Result<()> {
            self.state.lock().unwrap().macros_at_abort = Some(m.macros().clone());
            Ok(())
        }
    }

    async fn start_server(
        milter: TestMilter,
        actions: OptAction,
        protocol: OptProtocol,
        version: u32,
    ) -> SocketAddr {
        let mut server = Server::new(move || milter.clone());
        server.set_actions(actions);
        server.set_protocol(protocol);
        server.set_protocol_version(version);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    fn client(action_mask: OptAction) -> Client {
        Client::with_options(ClientOptions {
            action_mask,
            ..ClientOptions::default()
        })
    }

    #[tokio::test]
    async fn usual_flow() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut milter = TestMilter::new(state.clone());
        milter.emit_modifications = true;
        let addr = start_server(
            milter,
            OptAction::ADD_HEADER | OptAction::CHANGE_HEADER,
            OptProtocol::empty(),
            2,
        )
        .await;

        let client =
            client(OptAction::ADD_HEADER | OptAction::CHANGE_HEADER | OptAction::QUARANTINE);
        let mut session = client.connect(addr).await.unwrap();
        assert_eq!(
            session.action_mask(),
            OptAction::ADD_HEADER | OptAction::CHANGE_HEADER
        );

        let action = session
            .conn("host", ProtoFamily::Inet, 25565, "172.0.0.1")
            .await
            .unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.host, "host");
            assert_eq!(state.family, "tcp4");
            assert_eq!(state.port, 25565);
            assert_eq!(state.addr, Some("172.0.0.1".parse().unwrap()));
        }

        session
            .macros(Code::Helo, &[("tls_version", "very old")])
            .await
            .unwrap();

        let action = session.helo("helo_host").await.unwrap();
        assert!(action.is_continue());
        assert_eq!(state.lock().unwrap().helo, "helo_host");

        let action = session.mail("from@example.org", &["A=B"]).await.unwrap();
        assert!(action.is_continue());
        assert_eq!(state.lock().unwrap().from, "from@example.org");

        let action = session.rcpt("to1@example.org", &["A=B"]).await.unwrap();
        assert!(action.is_continue());
        let action = session.rcpt("to2@example.org", &["A=B"]).await.unwrap();
        assert!(action.is_continue());
        assert_eq!(
            state.lock().unwrap().rcpts,
            ["to1@example.org", "to2@example.org"]
        );

        let action = session
            .headers([
                ("From", "from@example.org"),
                ("To", "to@example.org"),
                ("x-empty-header", ""),
            ])
            .await
            .unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.headers.len(), 3);
            assert_eq!(state.headers.get_first("From"), Some("from@example.org"));
            assert_eq!(state.headers.get_first("To"), Some("to@example.org"));
            assert_eq!(state.headers.get_first("x-empty-header"), Some(""));
        }

        let body = vec![b'A'; 128000];
        let (modifications, action) = session.body_read_from(&body[..]).await.unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.chunks.len(), 2);
            assert!(state.chunks[0].len() <= MAX_BODY_CHUNK);
            assert!(state.chunks[0].len() + state.chunks[1].len() >= 128000);
        }

        assert_eq!(
            modifications,
            [
                ModifyAction::AddHeader {
                    name: "X-Bad".to_string(),
                    value: "very".to_string(),
                },
                ModifyAction::ChangeHeader {
                    index: 1,
                    name: "Subject".to_string(),
                    value: "***SPAM***".to_string(),
                },
                ModifyAction::Quarantine {
                    reason: "very bad message".to_string(),
                },
            ]
        );

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn abort_preserves_connection_clears_message() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let milter = TestMilter::new(state.clone());
        let addr = start_server(
            milter,
            OptAction::ADD_HEADER | OptAction::CHANGE_HEADER,
            OptProtocol::empty(),
            2,
        )
        .await;

        let client = client(OptAction::ADD_HEADER | OptAction::CHANGE_HEADER);
        let mut session = client.connect(addr).await.unwrap();

        let action = session
            .conn("host", ProtoFamily::Inet, 25565, "172.0.0.1")
            .await
            .unwrap();
        assert!(action.is_continue());

        session
            .macros(Code::Helo, &[("tls_version", "very old")])
            .await
            .unwrap();
        let action = session.helo("helo_host").await.unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.helo, "helo_host");
            assert_eq!(
                state.macros_at_helo.get("tls_version").map(String::as_str),
                Some("very old")
            );
        }

        session.abort().await.unwrap();

        let action = session.helo("repeated_helo_host").await.unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.helo, "repeated_helo_host");
            // Macro values survive up to the abort callback itself...
            let at_abort = state.macros_at_abort.as_ref().unwrap();
            assert_eq!(
                at_abort.get("tls_version").map(String::as_str),
                Some("very old")
            );
            // ...but the next message starts from an empty set. Connection
            // data is untouched.
            assert!(state.macros_at_helo.is_empty());
            assert_eq!(state.host, "host");
        }

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn reply_code_action() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut milter = TestMilter::new(state);
        milter.helo_response = Response::ReplyCode {
            code: 550,
            text: "go away".to_string(),
        };
        let addr = start_server(milter, OptAction::empty(), OptProtocol::empty(), 2).await;

        let mut session = Client::new().connect(addr).await.unwrap();
        let action = session.helo("helo_host").await.unwrap();
        assert_eq!(action.code, ActionCode::ReplyCode);
        assert_eq!(action.smtp_code, 550);
        assert_eq!(action.smtp_text, "go away");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_body_chunk_is_a_usage_error() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let milter = TestMilter::new(state.clone());
        let addr = start_server(milter, OptAction::empty(), OptProtocol::empty(), 2).await;

        let mut session = Client::new().connect(addr).await.unwrap();

        let err = session.body_chunk(&vec![b'A'; 70000]).await.unwrap_err();
        assert!(matches!(err, Error::TooBigBodyChunk(70000)));

        // Nothing was written, so the transport is still in sync.
        let action = session.body_chunk(b"hello").await.unwrap();
        assert!(action.is_continue());
        assert_eq!(state.lock().unwrap().chunks, [b"hello".to_vec()]);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn skip_stops_chunking_but_still_ends() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut milter = TestMilter::new(state.clone());
        milter.chunk_response = Response::Skip;
        let addr = start_server(milter, OptAction::empty(), OptProtocol::SKIP, 6).await;

        let client = Client::with_options(ClientOptions {
            protocol_mask: OptProtocol::SKIP,
            protocol_version: 6,
            ..ClientOptions::default()
        });
        let mut session = client.connect(addr).await.unwrap();
        assert!(session.protocol_mask().contains(OptProtocol::SKIP));

        let body = vec![b'A'; 150000];
        let (modifications, action) = session.body_read_from(&body[..]).await.unwrap();
        assert!(action.is_continue());
        assert!(modifications.is_empty());
        // Only the first chunk went out before the skip.
        assert_eq!(state.lock().unwrap().chunks.len(), 1);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn body_rewrite_modifications_round_trip() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut milter = TestMilter::new(state);
        milter.emit_body_rewrite = true;
        let addr = start_server(
            milter,
            OptAction::all(),
            OptProtocol::empty(),
            6,
        )
        .await;

        let client = client(OptAction::all());
        let mut session = client.connect(addr).await.unwrap();

        let action = session.mail("from@example.org", &[]).await.unwrap();
        assert!(action.is_continue());
        let (modifications, action) = session.end().await.unwrap();
        // The progress frame is skipped; the accept terminal comes through.
        assert_eq!(action.code, ActionCode::Accept);
        assert_eq!(
            modifications,
            [
                ModifyAction::InsertHeader {
                    index: 2,
                    name: "X-Inserted".to_string(),
                    value: "here".to_string(),
                },
                ModifyAction::DelRcpt {
                    rcpt: "<to1@example.org>".to_string(),
                },
                // CRLF pairs are rewritten to bare LF before serialisation.
                ModifyAction::ReplaceBody {
                    body: b"rewritten\nbody".to_vec(),
                },
                ModifyAction::ChangeFrom {
                    from: "other@example.org".to_string(),
                    args: vec!["A=B".to_string()],
                },
            ]
        );

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_message_keeps_transport_usable() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut milter = TestMilter::new(state.clone());
        milter.mail_response = Response::Reject;
        let addr = start_server(milter, OptAction::empty(), OptProtocol::empty(), 2).await;

        let mut session = Client::new().connect(addr).await.unwrap();

        let action = session.mail("first@example.org", &[]).await.unwrap();
        assert_eq!(action.code, ActionCode::Reject);

        // The filter moved on to a fresh handler; the same transport checks
        // the next message.
        let action = session.mail("second@example.org", &[]).await.unwrap();
        assert_eq!(action.code, ActionCode::Reject);
        assert_eq!(state.lock().unwrap().from, "second@example.org");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn newer_filter_version_is_compatible() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let milter = TestMilter::new(state.clone());
        let addr = start_server(milter, OptAction::empty(), OptProtocol::empty(), 6).await;

        // Client offers version 2; the session proceeds at the lower version.
        let mut session = Client::new().connect(addr).await.unwrap();
        let action = session.helo("helo_host").await.unwrap();
        assert!(action.is_continue());
        assert_eq!(state.lock().unwrap().helo, "helo_host");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn suppressed_reply_is_synthesized_on_both_ends() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let milter = TestMilter::new(state.clone());
        let addr = start_server(
            milter,
            OptAction::empty(),
            OptProtocol::NO_HELO_REPLY,
            6,
        )
        .await;

        let client = Client::with_options(ClientOptions {
            protocol_mask: OptProtocol::NO_HELO_REPLY,
            protocol_version: 6,
            ..ClientOptions::default()
        });
        let mut session = client.connect(addr).await.unwrap();

        let action = session.helo("helo_host").await.unwrap();
        assert!(action.is_continue());

        // The command went out and the turn stayed in sync.
        let action = session.mail("from@example.org", &[]).await.unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.helo, "helo_host");
            assert_eq!(state.from, "from@example.org");
        }

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn suppressed_command_is_never_sent() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let milter = TestMilter::new(state.clone());
        let addr = start_server(milter, OptAction::empty(), OptProtocol::NO_HELO, 2).await;

        let client = Client::with_options(ClientOptions {
            protocol_mask: OptProtocol::NO_HELO,
            ..ClientOptions::default()
        });
        let mut session = client.connect(addr).await.unwrap();

        let action = session.helo("helo_host").await.unwrap();
        assert!(action.is_continue());

        let action = session.mail("from@example.org", &[]).await.unwrap();
        assert!(action.is_continue());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.helo, "");
            assert_eq!(state.from, "from@example.org");
        }

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn negotiate_rejects_old_filter_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_packet(&mut socket, "test", None).await.unwrap();

            let mut payload = 1u32.to_be_bytes().to_vec();
            payload.extend_from_slice(&[0u8; 8]);
            write_packet(
                &mut socket,
                &Packet::with_payload(b'O', payload),
                "test",
                None,
            )
            .await
            .unwrap();
        });

        let err = Client::new().connect(addr).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(1)));
    }

    #[tokio::test]
    async fn negotiate_rejects_non_optneg_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_packet(&mut socket, "test", None).await.unwrap();
            write_packet(&mut socket, &Packet::new(b'c'), "test", None)
                .await
                .unwrap();
        });

        let err = Client::new().connect(addr).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                phase: "negotiate",
                violation: ProtocolViolation::UnexpectedCode('c'),
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn negotiate_read_deadline() {
        let (client_io, _held_open) = tokio::io::duplex(1024);
        let client = Client::with_options(ClientOptions {
            read_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        });
        let err = client.session(client_io).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut { phase: "negotiate", .. }));
    }

    #[tokio::test]
    async fn serve_after_close_reports_server_closed() {
        let server = Server::new(|| NoOpMilter);
        server.close();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = server.serve(listener).await.unwrap_err();
        assert!(matches!(err, Error::ServerClosed));
    }

    #[tokio::test]
    async fn close_wakes_serve_loop() {
        let server = Arc::new(Server::new(|| NoOpMilter));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        server.close();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ServerClosed));
    }
}
