use crate::codes::{Code, OptAction, OptProtocol, ProtoFamily, PROTOCOL_VERSION};
use crate::cstrings::{decode_cstrings, read_cstring};
use crate::error::{Error, ProtocolViolation};
use crate::headers::HeaderMap;
use crate::modifier::Modifier;
use crate::packet::{read_packet, read_u32, write_packet, Packet};
use crate::server::{HandlerFactory, Milter, Response};
use memchr::memchr;
use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::ControlFlow;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};

/// Filter-side state for one transport connection.
///
/// The macro map and accumulated headers are message-scoped; the handler is
/// replaced whenever a message concludes so that a single transport can
/// carry many messages.
pub(crate) struct ServerSession<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    actions: OptAction,
    protocol: OptProtocol,
    version: u32,
    macros: HashMap<String, String>,
    headers: HeaderMap,
    handler: Box<dyn Milter>,
    factory: HandlerFactory,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> ServerSession<T> {
    pub fn new(
        socket: T,
        actions: OptAction,
        protocol: OptProtocol,
        version: u32,
        factory: HandlerFactory,
    ) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        let handler = (*factory)();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            actions,
            protocol,
            version,
            macros: HashMap::new(),
            headers: HeaderMap::new(),
            handler,
            factory,
        }
    }

    /// Process commands until the peer quits, the transport drops, or an
    /// unrecoverable error occurs. Errors end the session and are logged;
    /// there is nobody upstream to hand them to.
    pub async fn run(mut self) {
        loop {
            let msg = match read_packet(&mut self.reader, "server", None).await {
                Ok(msg) => msg,
                Err(err) => {
                    if !err.is_eof() {
                        tracing::error!("error reading milter command: {err}");
                    }
                    return;
                }
            };

            match self.dispatch(msg).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return,
                Err(err) => {
                    tracing::error!("error performing milter command: {err:#}");
                    return;
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: Packet) -> anyhow::Result<ControlFlow<()>> {
        let code = match Code::try_from(msg.code) {
            Ok(code) => code,
            Err(byte) => {
                tracing::warn!("unrecognized milter command code {:?}", byte as char);
                return Ok(ControlFlow::Break(()));
            }
        };

        let response = match code {
            Code::OptNeg => {
                self.negotiate(&msg.payload).await?;
                return Ok(ControlFlow::Continue(()));
            }

            Code::Macro => {
                self.define_macros(&msg.payload)?;
                None
            }

            Code::Conn => self.on_connect(&msg.payload).await?,

            Code::Helo => {
                // The name arrives with a single trailing NUL.
                let name = match msg.payload.last() {
                    Some(0) => &msg.payload[..msg.payload.len() - 1],
                    _ => &msg.payload[..],
                };
                let name = String::from_utf8_lossy(name).into_owned();
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.helo(&name, &mut modifier).await?)
            }

            Code::Mail => {
                let from = read_cstring(&msg.payload);
                let from = from.trim_matches(|c| c == '<' || c == '>');
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.mail_from(from, &mut modifier).await?)
            }

            Code::Rcpt => {
                let rcpt = read_cstring(&msg.payload);
                let rcpt = rcpt.trim_matches(|c| c == '<' || c == '>');
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.rcpt_to(rcpt, &mut modifier).await?)
            }

            // Data announcement; no callback and no reply.
            Code::Data => None,

            Code::Header => {
                let mut decoded = decode_cstrings(&msg.payload).into_iter();
                let Some(name) = decoded.next() else {
                    return Err(Error::proto("server", ProtocolViolation::DataSize(0)).into());
                };
                let value = decoded.next().unwrap_or_default();
                self.headers.add(name.clone(), value.clone());
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.header(&name, &value, &mut modifier).await?)
            }

            Code::EndOfHeaders => {
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.headers(&self.headers, &mut modifier).await?)
            }

            Code::Body => {
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.body_chunk(&msg.payload, &mut modifier).await?)
            }

            Code::EndOfBody => {
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                Some(self.handler.body(&mut modifier).await?)
            }

            Code::Abort => {
                let mut modifier =
                    Modifier::new(&self.macros, &self.headers, &mut self.writer);
                self.handler.abort(&mut modifier).await?;
                self.macros = HashMap::new();
                self.headers = HeaderMap::new();
                None
            }

            // QuitNewConn keeps filter-wide state alive by definition, which
            // a single-process library satisfies trivially.
            Code::Quit | Code::QuitNewConn => return Ok(ControlFlow::Break(())),
        };

        if let Some(response) = response {
            let end_of_message = code == Code::EndOfBody || !response.is_continue();
            if !self.protocol.suppresses_reply(code) {
                write_packet(&mut self.writer, &response.to_packet(), "response", None).await?;
            }
            if end_of_message {
                // Ready for the next message on the same transport.
                self.handler = (*self.factory)();
                self.headers = HeaderMap::new();
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Answer an option negotiation, narrowing our masks to the common
    /// subset. The reply carries this filter's configured masks; both peers
    /// AND the two offers to reach the same effective value.
    async fn negotiate(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 4 * 3 {
            return Err(Error::proto(
                "negotiate",
                ProtocolViolation::DataSize(payload.len()),
            ));
        }
        let mta_version = read_u32(payload);
        if mta_version < PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(mta_version));
        }

        let mut reply = Vec::with_capacity(4 * 3);
        reply.extend_from_slice(&self.version.to_be_bytes());
        reply.extend_from_slice(&self.actions.bits().to_be_bytes());
        reply.extend_from_slice(&self.protocol.bits().to_be_bytes());

        self.actions &= OptAction::from_bits_retain(read_u32(&payload[4..]));
        self.protocol &= OptProtocol::from_bits_retain(read_u32(&payload[8..]));

        write_packet(
            &mut self.writer,
            &Packet::with_payload(Code::OptNeg as u8, reply),
            "negotiate",
            None,
        )
        .await
    }

    /// Replace the macro map. The first payload byte echoes the command the
    /// macros apply to; the rest is a name/value c-string sequence.
    fn define_macros(&mut self, payload: &[u8]) -> Result<(), Error> {
        let Some(pairs) = payload.get(1..) else {
            return Err(Error::proto("server", ProtocolViolation::DataSize(0)));
        };
        let strings = decode_cstrings(pairs);
        if strings.len() % 2 != 0 {
            tracing::warn!("macro definition with odd string count, padding empty value");
        }

        let mut macros = HashMap::with_capacity(strings.len() / 2);
        let mut strings = strings.into_iter();
        while let Some(name) = strings.next() {
            let value = strings.next().unwrap_or_default();
            macros.insert(name, value);
        }
        self.macros = macros;
        Ok(())
    }

    async fn on_connect(&mut self, payload: &[u8]) -> anyhow::Result<Option<Response>> {
        let Some(info) = parse_connect(payload) else {
            return Ok(Some(Response::TempFail));
        };
        let mut modifier = Modifier::new(&self.macros, &self.headers, &mut self.writer);
        let response = self
            .handler
            .connect(
                &info.host,
                info.family.name(),
                info.port,
                info.addr,
                &mut modifier,
            )
            .await?;
        Ok(Some(response))
    }
}

struct ConnectInfo {
    host: String,
    family: ProtoFamily,
    port: u16,
    addr: Option<IpAddr>,
}

fn parse_connect(payload: &[u8]) -> Option<ConnectInfo> {
    let nul = memchr(0, payload)?;
    let host = String::from_utf8_lossy(&payload[..nul]).into_owned();
    let rest = &payload[nul + 1..];

    let family = ProtoFamily::try_from(*rest.first()?).ok()?;
    let rest = &rest[1..];

    let (port, rest) = match family {
        ProtoFamily::Inet | ProtoFamily::Inet6 => {
            if rest.len() < 2 {
                return None;
            }
            (u16::from_be_bytes([rest[0], rest[1]]), &rest[2..])
        }
        _ => (0, rest),
    };

    let addr = match family {
        // The unix family carries a socket path here, which has no
        // parseable address form.
        ProtoFamily::Unknown | ProtoFamily::Unix => None,
        ProtoFamily::Inet | ProtoFamily::Inet6 => {
            Some(read_cstring(rest).parse::<IpAddr>().ok()?)
        }
    };

    Some(ConnectInfo {
        host,
        family,
        port,
        addr,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn connect_payload(host: &str, family: u8, port: Option<u16>, addr: Option<&str>) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(host.as_bytes());
        payload.push(0);
        payload.push(family);
        if let Some(port) = port {
            payload.extend_from_slice(&port.to_be_bytes());
        }
        if let Some(addr) = addr {
            payload.extend_from_slice(addr.as_bytes());
            payload.push(0);
        }
        payload
    }

    #[test]
    fn parse_inet_connect() {
        let payload = connect_payload("host", b'4', Some(25565), Some("172.0.0.1"));
        let info = parse_connect(&payload).unwrap();
        assert_eq!(info.host, "host");
        assert_eq!(info.family, ProtoFamily::Inet);
        assert_eq!(info.port, 25565);
        assert_eq!(info.addr, Some("172.0.0.1".parse().unwrap()));
    }

    #[test]
    fn parse_unix_and_unknown_connect() {
        let payload = connect_payload("host", b'L', None, Some("/run/mta.sock"));
        let info = parse_connect(&payload).unwrap();
        assert_eq!(info.family, ProtoFamily::Unix);
        assert_eq!(info.port, 0);
        assert_eq!(info.addr, None);

        let payload = connect_payload("host", b'U', None, None);
        let info = parse_connect(&payload).unwrap();
        assert_eq!(info.family, ProtoFamily::Unknown);
        assert_eq!(info.addr, None);
    }

    #[test]
    fn malformed_connect_payloads_are_rejected() {
        // No NUL after the hostname.
        assert!(parse_connect(b"host").is_none());
        // Family byte missing.
        assert!(parse_connect(b"host\0").is_none());
        // Port truncated.
        assert!(parse_connect(&connect_payload("host", b'4', None, None)).is_none());
        // Empty address for an inet family.
        let payload = connect_payload("host", b'4', Some(25), Some(""));
        assert!(parse_connect(&payload).is_none());
        // Unparseable address.
        let payload = connect_payload("host", b'6', Some(25), Some("not-an-ip"));
        assert!(parse_connect(&payload).is_none());
    }
}
