use crate::codes::{ActionCode, OptAction, OptProtocol, PROTOCOL_VERSION};
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::modifier::Modifier;
use crate::packet::Packet;
use crate::session::ServerSession;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Terminal reply produced by a handler callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    Accept,
    Discard,
    Reject,
    TempFail,
    /// [v6] Stop streaming more of the current body stage.
    Skip,
    /// Reject or tempfail with a custom SMTP status line.
    ReplyCode { code: u16, text: String },
}

impl Response {
    /// True when message processing proceeds past this reply.
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    pub(crate) fn to_packet(&self) -> Packet {
        match self {
            Self::Continue => Packet::new(ActionCode::Continue as u8),
            Self::Accept => Packet::new(ActionCode::Accept as u8),
            Self::Discard => Packet::new(ActionCode::Discard as u8),
            Self::Reject => Packet::new(ActionCode::Reject as u8),
            Self::TempFail => Packet::new(ActionCode::TempFail as u8),
            Self::Skip => Packet::new(ActionCode::Skip as u8),
            Self::ReplyCode { code, text } => {
                let mut payload = format!("{code:03} {text}").into_bytes();
                payload.push(0);
                Packet::with_payload(ActionCode::ReplyCode as u8, payload)
            }
        }
    }
}

/// Milter callback handler.
///
/// One instance exists per message; the server creates a fresh instance
/// through its factory whenever a message concludes, so implementations can
/// keep message-scoped state in plain fields. Every callback receives a
/// [`Modifier`] for reading macros/headers and, during [`Milter::body`],
/// for requesting message modifications.
///
/// All callbacks default to `Continue` (`body` defaults to `Accept`), so an
/// implementation only overrides the stages it cares about. Returning an
/// error terminates the session without a reply.
#[async_trait]
pub trait Milter: Send {
    /// SMTP connection information. Suppress with [`OptProtocol::NO_CONNECT`].
    async fn connect(
        &mut self,
        _host: &str,
        _family: &str,
        _port: u16,
        _addr: Option<IpAddr>,
        _m: &mut Modifier<'_>,
    ) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// HELO/EHLO name. Suppress with [`OptProtocol::NO_HELO`].
    async fn helo(&mut self, _name: &str, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// Envelope sender, with surrounding angle brackets already stripped.
    /// Suppress with [`OptProtocol::NO_MAIL_FROM`].
    async fn mail_from(&mut self, _from: &str, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// One envelope recipient. Suppress with [`OptProtocol::NO_RCPT_TO`].
    async fn rcpt_to(&mut self, _rcpt: &str, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// One header field. Suppress with [`OptProtocol::NO_HEADERS`].
    async fn header(
        &mut self,
        _name: &str,
        _value: &str,
        _m: &mut Modifier<'_>,
    ) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// All headers have been streamed. Suppress with [`OptProtocol::NO_EOH`].
    async fn headers(
        &mut self,
        _headers: &HeaderMap,
        _m: &mut Modifier<'_>,
    ) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// One body chunk of at most 64KB. Suppress with [`OptProtocol::NO_BODY`].
    async fn body_chunk(
        &mut self,
        _chunk: &[u8],
        _m: &mut Modifier<'_>,
    ) -> anyhow::Result<Response> {
        Ok(Response::Continue)
    }

    /// End of message. All modification requests must be made here, through
    /// the [`Modifier`], before the terminal response is returned.
    async fn body(&mut self, _m: &mut Modifier<'_>) -> anyhow::Result<Response> {
        Ok(Response::Accept)
    }

    /// The current message was aborted. Message-scoped state should be
    /// dropped; connection-scoped state is preserved.
    async fn abort(&mut self, _m: &mut Modifier<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Milter that waves every message through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMilter;

#[async_trait]
impl Milter for NoOpMilter {}

pub(crate) type HandlerFactory = Arc<dyn Fn() -> Box<dyn Milter> + Send + Sync>;

/// Filter-side protocol server.
///
/// The factory yields a fresh handler for every message and every transport
/// connection; it may be invoked concurrently from several session tasks.
pub struct Server {
    factory: HandlerFactory,
    actions: OptAction,
    protocol: OptProtocol,
    version: u32,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new<M, F>(factory: F) -> Self
    where
        M: Milter + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        Self {
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Milter>),
            actions: OptAction::empty(),
            protocol: OptProtocol::empty(),
            version: PROTOCOL_VERSION,
            shutdown,
        }
    }

    /// Modify actions this filter will ask permission for during negotiation.
    pub fn set_actions(&mut self, actions: OptAction) {
        self.actions = actions;
    }

    /// Protocol suppressions this filter wants during negotiation.
    pub fn set_protocol(&mut self, protocol: OptProtocol) {
        self.protocol = protocol;
    }

    /// Protocol version advertised in the negotiation reply: 2 by default,
    /// 6 to enable the v6 extensions.
    pub fn set_protocol_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Accept connections on `listener` until it fails or [`Server::close`]
    /// is called, spawning one session task per connection. Sessions already
    /// in flight keep running until their peer quits or the transport drops.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(Error::ServerClosed);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Err(Error::ServerClosed),
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(tuple) => tuple,
                        Err(err) => {
                            if *shutdown.borrow() {
                                return Err(Error::ServerClosed);
                            }
                            return Err(Error::Io { phase: "accept", source: err });
                        }
                    };
                    tracing::trace!("milter connection from {peer}");
                    let session = ServerSession::new(
                        socket,
                        self.actions,
                        self.protocol,
                        self.version,
                        self.factory.clone(),
                    );
                    tokio::spawn(session.run());
                }
            }
        }
    }

    /// Mark the server as shut down and wake every serve loop, which drops
    /// its listener and returns [`Error::ServerClosed`].
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
