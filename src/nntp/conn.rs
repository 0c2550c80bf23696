//! Async NNTP session over TCP or TLS
//!
//! One [`NntpConnection`] is one authenticated session to an upstream. The
//! command surface is exactly what the gateway needs: ARTICLE, HEAD, STAT,
//! POST, AUTHINFO, QUIT. Multiline article bodies are consumed line by line
//! through [`NntpConnection::read_body_line`], which performs dot-unstuffing
//! (RFC 3977 §3.1.1) unless the caller asked for the raw encoded form.
//!
//! Connection establishment follows the factory contract: any failure during
//! greeting or authentication drops the socket before the error is returned,
//! and no retries happen at this layer.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, trace};

use super::article::{Headers, OutboundArticle};
use super::codes;
use super::error::NntpError;
use super::message_id::MessageId;
use crate::config::ServerConfig;

enum NntpStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

/// One NNTP session bound to a single upstream
pub struct NntpConnection {
    stream: NntpStream,
    line_buf: Vec<u8>,
    /// Set once the body terminator (or an empty body) has been consumed
    body_done: bool,
}

/// A parsed single-line response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub message: String,
}

enum BlockLine {
    Terminator,
    Blank,
    Text(String),
}

impl NntpConnection {
    /// Establish an authenticated session per the server definition.
    ///
    /// Dials TCP (or TLS when `server.tls`), consumes the greeting and runs
    /// AUTHINFO USER/PASS when credentials are configured. The socket is
    /// closed on any failure.
    pub async fn connect(server: &ServerConfig) -> Result<Self, NntpError> {
        let tcp = TcpStream::connect(server.host.as_str()).await?;

        let stream = if server.tls {
            let hostname = server
                .host
                .rsplit_once(':')
                .map_or(server.host.as_str(), |(h, _)| h);
            let tls = tls_connect(tcp, hostname).await?;
            NntpStream::Tls(Box::new(BufReader::new(tls)))
        } else {
            NntpStream::Plain(BufReader::new(tcp))
        };

        let mut conn = Self {
            stream,
            line_buf: Vec::with_capacity(1024),
            body_done: true,
        };

        let greeting = conn.read_response().await?;
        if greeting.code != codes::POSTING_ALLOWED && greeting.code != codes::NO_POSTING {
            return Err(NntpError::BadGreeting(format!(
                "{} {}",
                greeting.code, greeting.message
            )));
        }

        if let Some(user) = &server.user {
            conn.cmd_authinfo(user, server.pass.as_deref().unwrap_or(""))
                .await?;
            debug!(host = %server.host, "authenticated NNTP session");
        }

        Ok(conn)
    }

    /// AUTHINFO USER/PASS exchange (RFC 4643 §2.3)
    pub async fn cmd_authinfo(&mut self, user: &str, pass: &str) -> Result<(), NntpError> {
        self.send_line(&format!("AUTHINFO USER {user}")).await?;
        let resp = self.read_response().await?;
        let resp = match resp.code {
            codes::AUTH_ACCEPTED => return Ok(()),
            codes::PASSWORD_REQUIRED => {
                self.send_line(&format!("AUTHINFO PASS {pass}")).await?;
                self.read_response().await?
            }
            _ => resp,
        };
        if resp.code == codes::AUTH_ACCEPTED {
            Ok(())
        } else {
            Err(NntpError::AuthFailed {
                code: resp.code,
                message: resp.message,
            })
        }
    }

    /// ARTICLE by Message-ID (RFC 3977 §6.2.1).
    ///
    /// Returns the parsed header block; the body stays pending on the wire
    /// and is drained with [`read_body_line`](Self::read_body_line).
    pub async fn cmd_article(&mut self, id: &MessageId) -> Result<Headers, NntpError> {
        self.send_line(&format!("ARTICLE {}", id.angled())).await?;
        let resp = self.read_response().await?;
        if resp.code != codes::ARTICLE_FOLLOWS {
            return Err(NntpError::Status {
                code: resp.code,
                message: resp.message,
            });
        }
        self.read_header_block().await
    }

    /// HEAD by Message-ID (RFC 3977 §6.2.2); consumes the whole response
    pub async fn cmd_head(&mut self, id: &MessageId) -> Result<Headers, NntpError> {
        self.send_line(&format!("HEAD {}", id.angled())).await?;
        let resp = self.read_response().await?;
        if resp.code != codes::HEAD_FOLLOWS {
            return Err(NntpError::Status {
                code: resp.code,
                message: resp.message,
            });
        }

        let mut headers = Headers::new();
        loop {
            match self.read_block_line().await? {
                BlockLine::Terminator => break,
                BlockLine::Blank => continue,
                BlockLine::Text(text) => {
                    headers.parse_line(&text);
                }
            }
        }
        Ok(headers)
    }

    /// STAT by Message-ID (RFC 3977 §6.2.4): true if the article exists
    pub async fn cmd_stat(&mut self, id: &MessageId) -> Result<bool, NntpError> {
        self.send_line(&format!("STAT {}", id.angled())).await?;
        let resp = self.read_response().await?;
        match resp.code {
            codes::ARTICLE_EXISTS => Ok(true),
            codes::NO_SUCH_ARTICLE => Ok(false),
            code => Err(NntpError::Status {
                code,
                message: resp.message,
            }),
        }
    }

    /// POST an article (RFC 3977 §6.3.1).
    ///
    /// With `raw` the body is trusted to be dot-encoded already and written
    /// verbatim; otherwise it is dot-encoded here.
    pub async fn cmd_post(
        &mut self,
        article: &OutboundArticle,
        raw: bool,
    ) -> Result<(), NntpError> {
        self.send_line("POST").await?;
        let resp = self.read_response().await?;
        if resp.code != codes::SEND_ARTICLE {
            return Err(NntpError::Status {
                code: resp.code,
                message: resp.message,
            });
        }

        let mut payload = Vec::with_capacity(article.body.len() + 256);
        payload.extend_from_slice(
            format!("Message-ID: {}\r\n", article.message_id.angled()).as_bytes(),
        );
        for (name, value) in article.headers.iter() {
            payload.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        payload.extend_from_slice(b"\r\n");
        if raw {
            payload.extend_from_slice(&article.body);
            if !article.body.is_empty() && !article.body.ends_with(b"\r\n") {
                payload.extend_from_slice(b"\r\n");
            }
        } else {
            dot_encode_into(&article.body, &mut payload);
        }
        payload.extend_from_slice(b".\r\n");
        self.write_all(&payload).await?;

        let resp = self.read_response().await?;
        if resp.code != codes::ARTICLE_RECEIVED {
            return Err(NntpError::Status {
                code: resp.code,
                message: resp.message,
            });
        }
        Ok(())
    }

    /// One body line including its CRLF, or `None` once the terminator has
    /// been consumed. With `raw` the dot-stuffing is passed through; the
    /// terminator line itself is never returned.
    pub async fn read_body_line(&mut self, raw: bool) -> Result<Option<&[u8]>, NntpError> {
        if self.body_done {
            return Ok(None);
        }
        self.line_buf.clear();
        let n = match &mut self.stream {
            NntpStream::Plain(r) => r.read_until(b'\n', &mut self.line_buf).await?,
            NntpStream::Tls(r) => r.read_until(b'\n', &mut self.line_buf).await?,
        };
        if n == 0 {
            return Err(NntpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF mid-body",
            )));
        }
        if self.line_buf == b".\r\n" || self.line_buf == b".\n" {
            self.body_done = true;
            return Ok(None);
        }
        if !raw && self.line_buf.first() == Some(&b'.') {
            return Ok(Some(&self.line_buf[1..]));
        }
        Ok(Some(&self.line_buf))
    }

    /// Best-effort QUIT; errors are ignored, the socket closes on drop
    pub async fn quit(&mut self) {
        if self.send_line("QUIT").await.is_ok() {
            let _ = self.read_response().await;
        }
    }

    async fn read_header_block(&mut self) -> Result<Headers, NntpError> {
        let mut headers = Headers::new();
        loop {
            match self.read_block_line().await? {
                BlockLine::Terminator => {
                    // Headers ran straight into the terminator: empty body
                    self.body_done = true;
                    return Ok(headers);
                }
                BlockLine::Blank => {
                    self.body_done = false;
                    return Ok(headers);
                }
                BlockLine::Text(text) => {
                    headers.parse_line(&text);
                }
            }
        }
    }

    /// One line of a header block, classified; owning the text keeps the
    /// read buffer free for the next line
    async fn read_block_line(&mut self) -> Result<BlockLine, NntpError> {
        let line = self.read_wire_line().await?;
        if line == b".\r\n" || line == b".\n" {
            return Ok(BlockLine::Terminator);
        }
        let text = trim_crlf(line);
        if text.is_empty() {
            return Ok(BlockLine::Blank);
        }
        Ok(BlockLine::Text(
            String::from_utf8_lossy(unstuff(text)).into_owned(),
        ))
    }

    async fn read_wire_line(&mut self) -> Result<&[u8], NntpError> {
        self.line_buf.clear();
        let n = match &mut self.stream {
            NntpStream::Plain(r) => r.read_until(b'\n', &mut self.line_buf).await?,
            NntpStream::Tls(r) => r.read_until(b'\n', &mut self.line_buf).await?,
        };
        if n == 0 {
            return Err(NntpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected EOF",
            )));
        }
        Ok(&self.line_buf)
    }

    async fn read_response(&mut self) -> Result<Response, NntpError> {
        let line = self.read_wire_line().await?;
        let text = String::from_utf8_lossy(trim_crlf(line)).into_owned();
        trace!(response = %text, "NNTP response");
        parse_response(&text)
    }

    async fn send_line(&mut self, cmd: &str) -> Result<(), NntpError> {
        trace!(command = %cmd, "NNTP command");
        let mut line = Vec::with_capacity(cmd.len() + 2);
        line.extend_from_slice(cmd.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.write_all(&line).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), NntpError> {
        match &mut self.stream {
            NntpStream::Plain(s) => {
                s.get_mut().write_all(data).await?;
                s.get_mut().flush().await?;
            }
            NntpStream::Tls(s) => {
                s.get_mut().write_all(data).await?;
                s.get_mut().flush().await?;
            }
        }
        Ok(())
    }
}

/// Parse a `NNN text` response line
pub fn parse_response(line: &str) -> Result<Response, NntpError> {
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return Err(NntpError::BadResponse(line.to_string()));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| NntpError::BadResponse(line.to_string()))?;
    Ok(Response {
        code,
        message: line[3..].trim_start().to_string(),
    })
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn unstuff(line: &[u8]) -> &[u8] {
    if line.first() == Some(&b'.') {
        &line[1..]
    } else {
        line
    }
}

/// Dot-encode `body` into `out`: normalize line endings to CRLF, double a
/// leading dot, guarantee a trailing CRLF (RFC 3977 §3.1.1)
fn dot_encode_into(body: &[u8], out: &mut Vec<u8>) {
    if body.is_empty() {
        return;
    }
    for line in body.split(|&b| b == b'\n') {
        let line = if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        };
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    // A body ending in a newline produced one empty trailing segment
    if body.ends_with(b"\n") {
        out.truncate(out.len() - 2);
    }
}

async fn tls_connect(tcp: TcpStream, hostname: &str) -> Result<TlsStream<TcpStream>, NntpError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| NntpError::Tls(format!("invalid hostname: {hostname}")))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| NntpError::Tls(e.to_string()))
}
