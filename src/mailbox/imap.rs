//! Raw IMAP transport over rustls.
//!
//! Each call opens a fresh short-lived session (connect, login, select,
//! command, logout). The poll interval is long enough that connection
//! reuse buys nothing, and a fresh session cannot be poisoned by a
//! half-read response from a previous failure. The protocol exchange is
//! blocking and runs inside `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::MailboxConfig;
use crate::error::ChannelError;
use crate::mailbox::MailboxTransport;

/// IMAP mailbox transport.
pub struct ImapTransport {
    config: MailboxConfig,
}

impl ImapTransport {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxTransport for ImapTransport {
    async fn search_unseen(&self) -> Result<Vec<String>, ChannelError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config)?;
            let uids = session.search_unseen()?;
            session.logout();
            Ok(uids)
        })
        .await
        .map_err(|e| ChannelError::Protocol(format!("IMAP task panicked: {e}")))?
    }

    async fn fetch(&self, id: &str) -> Result<Vec<u8>, ChannelError> {
        let config = self.config.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config)?;
            let raw = session.fetch(&id)?;
            session.logout();
            Ok(raw)
        })
        .await
        .map_err(|e| ChannelError::Protocol(format!("IMAP task panicked: {e}")))?
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One logged-in IMAP session with INBOX selected.
struct ImapSession {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    fn open(config: &MailboxConfig) -> Result<Self, ChannelError> {
        let connect_failed = |reason: String| ChannelError::ConnectFailed {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| connect_failed(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| connect_failed(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())
                .map_err(|e| connect_failed(format!("Invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_failed(format!("TLS setup failed: {e}")))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self {
            tls,
            tag_counter: 1,
        };

        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !login.last().is_some_and(|l| l.contains("OK")) {
            return Err(ChannelError::AuthFailed {
                host: config.imap_host.clone(),
            });
        }

        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(ChannelError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(ChannelError::Protocol(e.to_string())),
            }
        }
    }

    /// Send one tagged command and read lines until the tagged response.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ChannelError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.tls
            .write_all(full.as_bytes())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.tls
            .flush()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn search_unseen(&mut self) -> Result<Vec<String>, ChannelError> {
        let resp = self.command("SEARCH UNSEEN")?;
        Ok(parse_search_response(&resp))
    }

    /// FETCH RFC822 implicitly sets \Seen, so a fetched message will not
    /// reappear in the next unseen search.
    fn fetch(&mut self, uid: &str) -> Result<Vec<u8>, ChannelError> {
        let resp = self.command(&format!("FETCH {uid} RFC822"))?;
        Ok(extract_fetch_body(&resp).into_bytes())
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Pull message ids out of an untagged `* SEARCH n n n` response.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(String::from));
        }
    }
    uids
}

/// The message body is everything between the untagged FETCH line and
/// the closing paren + tagged OK.
fn extract_fetch_body(lines: &[String]) -> String {
    lines
        .iter()
        .skip(1)
        .take(lines.len().saturating_sub(2))
        .cloned()
        .collect()
}
