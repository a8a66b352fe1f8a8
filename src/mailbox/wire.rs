//! IMAP4rev1 client over TCP or TLS (rustls).
//!
//! The socket is blocking; every command runs inside `spawn_blocking` with the
//! socket read/write timeout set to the deadline of the phase it belongs to.
//! A command also gives up between reads once that deadline has passed, and
//! dropping the transport shuts the socket down so an abandoned command
//! returns at once instead of holding a pool thread.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::{ImapConfig, TimeoutConfig};
use crate::error::IngestError;
use crate::mailbox::transport::{Connector, MailTransport, MailboxInfo, RawMessage, uid_set};

/// Literals larger than this are treated as a protocol violation.
const MAX_LITERAL: usize = 64 * 1024 * 1024;

static FETCH_UID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bUID (\d+)").unwrap());
static FETCH_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bRFC822\.SIZE (\d+)").unwrap());
static FETCH_FLAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFLAGS \(([^)]*)\)").unwrap());
static FETCH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bINTERNALDATE "([^"]+)""#).unwrap());
static STATUS_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(MESSAGES|UNSEEN|UIDVALIDITY|UIDNEXT) (\d+)").unwrap());
static RESP_CODE_NUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(UIDVALIDITY|UIDNEXT|UNSEEN) (\d+)\]").unwrap());

trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

/// Tagged completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Status {
    #[default]
    Ok,
    No,
    Bad,
}

/// An untagged response line, with the literals embedded in it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Untagged {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// Everything the server sent for one tagged command.
#[derive(Debug, Clone, Default)]
pub(crate) struct Response {
    pub untagged: Vec<Untagged>,
    pub status: Status,
    pub text: String,
}

impl Response {
    fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

fn io_err(context: &str, e: std::io::Error) -> IngestError {
    IngestError::Connection(format!("{context}: {e}"))
}

/// One open IMAP connection.
pub(crate) struct ImapStream {
    reader: BufReader<Box<dyn Stream>>,
    /// Handle used to adjust socket timeouts; `None` for in-memory streams.
    socket: Option<TcpStream>,
    /// End of the current command's deadline.
    deadline: Option<Instant>,
    tag: u32,
}

impl ImapStream {
    fn new(stream: Box<dyn Stream>, socket: Option<TcpStream>) -> Self {
        Self {
            reader: BufReader::new(stream),
            socket,
            deadline: None,
            tag: 0,
        }
    }

    fn set_deadline(&mut self, deadline: Duration) -> Result<(), IngestError> {
        self.deadline = Some(Instant::now() + deadline);
        if let Some(socket) = &self.socket {
            let deadline = Some(deadline.max(Duration::from_millis(1)));
            socket
                .set_read_timeout(deadline)
                .map_err(|e| io_err("set read timeout", e))?;
            socket
                .set_write_timeout(deadline)
                .map_err(|e| io_err("set write timeout", e))?;
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), IngestError> {
        match self.deadline {
            Some(at) if Instant::now() >= at => Err(IngestError::Connection(
                "IMAP command deadline elapsed".into(),
            )),
            _ => Ok(()),
        }
    }

    fn read_line(&mut self) -> Result<String, IngestError> {
        self.check_deadline()?;
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| io_err("IMAP read", e))?;
        if n == 0 {
            return Err(IngestError::Connection("IMAP connection closed".into()));
        }
        while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn read_greeting(&mut self) -> Result<(), IngestError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else if line.starts_with("* BYE") {
            Err(IngestError::Connection(format!("server refused connection: {line}")))
        } else {
            Err(IngestError::Protocol(format!("unexpected greeting: {line}")))
        }
    }

    /// Send a command and collect its response.
    fn command(&mut self, cmd: &str) -> Result<Response, IngestError> {
        self.tag += 1;
        let tag = format!("A{:04}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        let writer = self.reader.get_mut();
        writer
            .write_all(full.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| io_err("IMAP write", e))?;
        self.read_response(&tag)
    }

    fn read_response(&mut self, tag: &str) -> Result<Response, IngestError> {
        let mut response = Response::default();
        let mut current: Option<Untagged> = None;
        let tagged_prefix = format!("{tag} ");

        loop {
            let line = self.read_line()?;

            let mut untagged = match current.take() {
                // Continuation of a line that carried a literal.
                Some(mut partial) => {
                    partial.text.push_str(&line);
                    partial
                }
                None => {
                    if let Some(rest) = line.strip_prefix("* ") {
                        Untagged {
                            text: rest.to_string(),
                            literals: Vec::new(),
                        }
                    } else if let Some(rest) = line.strip_prefix(&tagged_prefix) {
                        let (status, text) = parse_status(rest)?;
                        response.status = status;
                        response.text = text;
                        return Ok(response);
                    } else if line.starts_with('+') {
                        return Err(IngestError::Protocol(format!(
                            "unexpected continuation request: {line}"
                        )));
                    } else {
                        return Err(IngestError::Protocol(format!("unexpected line: {line}")));
                    }
                }
            };

            match trailing_literal(&untagged.text) {
                Some(len) => {
                    if len > MAX_LITERAL {
                        return Err(IngestError::Protocol(format!(
                            "literal of {len} bytes exceeds limit"
                        )));
                    }
                    self.check_deadline()?;
                    let mut literal = vec![0u8; len];
                    self.reader
                        .read_exact(&mut literal)
                        .map_err(|e| io_err("IMAP literal read", e))?;
                    untagged.literals.push(literal);
                    current = Some(untagged);
                }
                None => response.untagged.push(untagged),
            }
        }
    }
}

fn parse_status(rest: &str) -> Result<(Status, String), IngestError> {
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        other => {
            return Err(IngestError::Protocol(format!("unknown completion status: {other}")));
        }
    };
    Ok((status, text.to_string()))
}

/// Length of a `{N}` / `{N+}` literal announced at the end of a line.
fn trailing_literal(text: &str) -> Option<usize> {
    let body = text.strip_suffix('}')?;
    let open = body.rfind('{')?;
    let digits = body[open + 1..].trim_end_matches('+');
    digits.parse().ok()
}

/// Quote a string for use as an IMAP astring.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn check(resp: &Response, what: &str) -> Result<(), IngestError> {
    match resp.status {
        Status::Ok => Ok(()),
        Status::No | Status::Bad => Err(IngestError::Protocol(format!(
            "{what} failed: {:?} {}",
            resp.status, resp.text
        ))),
    }
}

fn parse_search(resp: &Response) -> Vec<u64> {
    resp.untagged
        .iter()
        .filter_map(|u| u.text.strip_prefix("SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse::<u64>().ok()))
        .collect()
}

fn apply_status_items(info: &mut MailboxInfo, text: &str) {
    for cap in STATUS_ITEM.captures_iter(text) {
        let value = &cap[2];
        match &cap[1] {
            "MESSAGES" => info.exists = value.parse().unwrap_or(info.exists),
            "UNSEEN" => info.unseen = value.parse().ok(),
            "UIDVALIDITY" => info.uid_validity = value.parse().ok(),
            "UIDNEXT" => info.uid_next = value.parse().ok(),
            _ => {}
        }
    }
}

fn parse_select(name: &str, status: &Response, select: &Response) -> MailboxInfo {
    let mut info = MailboxInfo {
        name: name.to_string(),
        ..MailboxInfo::default()
    };
    for u in &status.untagged {
        if u.text.starts_with("STATUS") {
            apply_status_items(&mut info, &u.text);
        }
    }
    for u in &select.untagged {
        if let Some(count) = u.text.strip_suffix(" EXISTS") {
            if let Ok(n) = count.trim().parse() {
                info.exists = n;
            }
        } else if let Some(cap) = RESP_CODE_NUM.captures(&u.text) {
            match &cap[1] {
                "UIDVALIDITY" => info.uid_validity = cap[2].parse().ok(),
                "UIDNEXT" => info.uid_next = cap[2].parse().ok(),
                // [UNSEEN n] is a sequence number, not a count.
                _ => {}
            }
        }
    }
    info.read_only = select.text.contains("[READ-ONLY]");
    info
}

fn parse_internal_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_fetch(resp: &Response) -> Vec<RawMessage> {
    let mut out = Vec::new();
    for u in &resp.untagged {
        let mut words = u.text.splitn(3, ' ');
        let (Some(_seq), Some(kind)) = (words.next(), words.next()) else {
            continue;
        };
        if !kind.eq_ignore_ascii_case("FETCH") {
            continue;
        }
        let Some(uid) = FETCH_UID
            .captures(&u.text)
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            continue;
        };
        let flags = FETCH_FLAGS
            .captures(&u.text)
            .map(|c| c[1].split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        out.push(RawMessage {
            uid,
            flags,
            internal_date: FETCH_DATE
                .captures(&u.text)
                .and_then(|c| parse_internal_date(&c[1])),
            size: FETCH_SIZE
                .captures(&u.text)
                .and_then(|c| c[1].parse().ok()),
            data: u.literals.first().cloned().unwrap_or_default(),
        });
    }
    out
}

// ── Transport ───────────────────────────────────────────────────────

/// `MailTransport` over a blocking IMAP stream.
pub struct ImapTransport {
    inner: Arc<Mutex<ImapStream>>,
    /// Socket handle kept outside the lock; shut down on drop to unblock a
    /// command still running on the blocking pool.
    abort: Option<TcpStream>,
    timeouts: TimeoutConfig,
}

impl ImapTransport {
    fn new(stream: ImapStream, timeouts: TimeoutConfig) -> Self {
        let abort = stream.socket.as_ref().and_then(|s| s.try_clone().ok());
        Self {
            inner: Arc::new(Mutex::new(stream)),
            abort,
            timeouts,
        }
    }

    /// Run `f` against the stream on the blocking pool.
    async fn blocking<T, F>(&self, deadline: Duration, f: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut ImapStream) -> Result<T, IngestError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut stream = inner
                .lock()
                .map_err(|_| IngestError::Connection("IMAP stream lock poisoned".into()))?;
            stream.set_deadline(deadline)?;
            f(&mut stream)
        })
        .await
        .map_err(|e| IngestError::Connection(format!("IMAP task failed: {e}")))?
    }
}

impl Drop for ImapTransport {
    fn drop(&mut self) {
        if let Some(socket) = &self.abort
            && let Err(e) = socket.shutdown(Shutdown::Both)
        {
            debug!(error = %e, "IMAP socket shutdown failed");
        }
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn login(&mut self, username: &str, password: &SecretString) -> Result<(), IngestError> {
        let user = username.to_string();
        let password = password.clone();
        self.blocking(self.timeouts.login, move |s| {
            let cmd = format!("LOGIN {} {}", quote(&user), quote(password.expose_secret()));
            let resp = s.command(&cmd)?;
            match resp.status {
                Status::Ok => Ok(()),
                Status::No => Err(IngestError::Auth {
                    user,
                    reason: resp.text,
                }),
                Status::Bad => Err(IngestError::Protocol(format!("LOGIN rejected: {}", resp.text))),
            }
        })
        .await
    }

    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxInfo, IngestError> {
        let name = mailbox.to_string();
        self.blocking(self.timeouts.connect, move |s| {
            let status = s.command(&format!(
                "STATUS {} (MESSAGES UNSEEN UIDVALIDITY UIDNEXT)",
                quote(&name)
            ))?;
            if status.status == Status::No {
                return Err(IngestError::MailboxNotFound(name));
            }
            check(&status, "STATUS")?;

            let verb = if read_only { "EXAMINE" } else { "SELECT" };
            let select = s.command(&format!("{verb} {}", quote(&name)))?;
            if select.status == Status::No {
                return Err(IngestError::MailboxNotFound(name));
            }
            check(&select, verb)?;
            Ok(parse_select(&name, &status, &select))
        })
        .await
    }

    async fn noop(&mut self) -> Result<(), IngestError> {
        self.blocking(self.timeouts.connect, |s| {
            let resp = s.command("NOOP")?;
            check(&resp, "NOOP")
        })
        .await
    }

    async fn uid_search(&mut self, since_uid: u64) -> Result<Vec<u64>, IngestError> {
        self.blocking(self.timeouts.fetch, move |s| {
            let resp = s.command(&format!("UID SEARCH UID {}:*", since_uid.saturating_add(1)))?;
            check(&resp, "UID SEARCH")?;
            Ok(parse_search(&resp))
        })
        .await
    }

    async fn uid_fetch(
        &mut self,
        uids: &[u64],
        include_body: bool,
    ) -> Result<Vec<RawMessage>, IngestError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        self.blocking(self.timeouts.fetch, move |s| {
            let section = if include_body { "BODY.PEEK[]" } else { "BODY.PEEK[HEADER]" };
            let resp = s.command(&format!(
                "UID FETCH {set} (UID FLAGS INTERNALDATE RFC822.SIZE {section})"
            ))?;
            check(&resp, "UID FETCH")?;
            let records = parse_fetch(&resp);
            debug!(set = %set, records = records.len(), "UID FETCH complete");
            Ok(records)
        })
        .await
    }

    async fn mark_seen(&mut self, uids: &[u64]) -> Result<(), IngestError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        self.blocking(self.timeouts.fetch, move |s| {
            let resp = s.command(&format!("UID STORE {set} +FLAGS.SILENT (\\Seen)"))?;
            check(&resp, "UID STORE")
        })
        .await
    }

    async fn logout(&mut self) -> Result<(), IngestError> {
        self.blocking(self.timeouts.connect, |s| {
            let resp = s.command("LOGOUT")?;
            check(&resp, "LOGOUT")
        })
        .await
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Opens real IMAP connections.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    timeouts: TimeoutConfig,
}

impl ImapConnector {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self, imap: &ImapConfig) -> Result<Box<dyn MailTransport>, IngestError> {
        let host = imap.host.clone();
        let port = imap.port;
        let tls = imap.tls;
        let timeout = self.timeouts.connect;

        let stream = tokio::task::spawn_blocking(move || open_stream(&host, port, tls, timeout))
            .await
            .map_err(|e| IngestError::Connection(format!("IMAP connect task failed: {e}")))??;

        debug!(host = %imap.host, port = imap.port, tls = imap.tls, "IMAP connection open");
        Ok(Box::new(ImapTransport::new(stream, self.timeouts)))
    }
}

fn open_stream(host: &str, port: u16, tls: bool, timeout: Duration) -> Result<ImapStream, IngestError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| io_err(&format!("resolve {host}:{port}"), e))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => {
                tcp = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = match (tcp, last_err) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(io_err(&format!("connect {host}:{port}"), e)),
        (None, None) => {
            return Err(IngestError::Connection(format!("{host}:{port} did not resolve")));
        }
    };
    tcp.set_read_timeout(Some(timeout))
        .map_err(|e| io_err("set read timeout", e))?;
    tcp.set_write_timeout(Some(timeout))
        .map_err(|e| io_err("set write timeout", e))?;
    let socket = tcp.try_clone().map_err(|e| io_err("clone socket", e))?;

    let boxed: Box<dyn Stream> = if tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| IngestError::Connection(format!("invalid server name {host}: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| IngestError::Connection(format!("TLS setup failed: {e}")))?;
        Box::new(rustls::StreamOwned::new(conn, tcp))
    } else {
        Box::new(tcp)
    };

    let mut stream = ImapStream::new(boxed, Some(socket));
    stream.read_greeting()?;
    Ok(stream)
}
