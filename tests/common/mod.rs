#![allow(dead_code)]
//! Scripted in-process NNTP upstream for integration tests
//!
//! Speaks just enough RFC 3977 for the gateway: greeting, AUTHINFO,
//! ARTICLE/HEAD/STAT by Message-ID, POST and QUIT. Tests populate articles
//! up front and can flip failure modes (posting refusal, mid-body drops).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use nntp_gateway::ServerConfig;

/// One article held by the mock: header pairs plus the decoded body bytes
#[derive(Debug, Clone, Default)]
pub struct StoredArticle {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct State {
    articles: Mutex<HashMap<String, StoredArticle>>,
    /// Raw header+body text of every accepted POST, in arrival order
    posted: Mutex<Vec<String>>,
    /// When set, ARTICLE responses stop mid-body and the socket drops
    drop_mid_body: AtomicBool,
    /// Status code answering the POST command itself (340 = accept)
    post_response: AtomicU16,
    /// Sessions currently open, and the high-water mark
    open_sessions: AtomicUsize,
    max_sessions: AtomicUsize,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<State>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            post_response: AtomicU16::new(340),
            ..State::default()
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                let session_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let open = session_state.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
                    session_state.max_sessions.fetch_max(open, Ordering::SeqCst);
                    let _ = serve_session(sock, &session_state).await;
                    session_state.open_sessions.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, state }
    }

    /// A server definition pointing at this mock
    pub fn server_config(&self, posting: bool, connections: u32) -> ServerConfig {
        ServerConfig {
            host: self.addr.to_string(),
            user: None,
            pass: None,
            tls: false,
            posting,
            connections,
        }
    }

    pub fn add_article(&self, short_id: &str, article: StoredArticle) {
        self.state
            .articles
            .lock()
            .unwrap()
            .insert(short_id.to_string(), article);
    }

    /// Convenience: a plain text article with a couple of common headers
    pub fn add_text_article(&self, short_id: &str, body: &[u8]) {
        self.add_article(
            short_id,
            StoredArticle {
                headers: vec![
                    ("Subject".to_string(), format!("about {short_id}")),
                    ("From".to_string(), "poster@example.com".to_string()),
                    ("Organization".to_string(), "Example Org".to_string()),
                    ("X-Complaints-To".to_string(), "abuse@example.com".to_string()),
                ],
                body: body.to_vec(),
            },
        );
    }

    pub fn set_drop_mid_body(&self, drop: bool) {
        self.state.drop_mid_body.store(drop, Ordering::SeqCst);
    }

    /// Answer POST itself with this status instead of 340
    pub fn set_post_response(&self, code: u16) {
        self.state.post_response.store(code, Ordering::SeqCst);
    }

    /// Raw header+body text of accepted POSTs
    pub fn posted(&self) -> Vec<String> {
        self.state.posted.lock().unwrap().clone()
    }

    /// Highest number of concurrently open sessions seen so far
    pub fn max_sessions(&self) -> usize {
        self.state.max_sessions.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }
}

async fn serve_session(sock: TcpStream, state: &State) -> std::io::Result<()> {
    let (read_half, mut write_half) = sock.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"200 mock news server ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        let upper = command.to_ascii_uppercase();

        if upper.starts_with("AUTHINFO USER") {
            write_half.write_all(b"381 password required\r\n").await?;
        } else if upper.starts_with("AUTHINFO PASS") {
            write_half.write_all(b"281 authentication accepted\r\n").await?;
        } else if upper.starts_with("ARTICLE") {
            respond_article(command, state, &mut write_half, true).await?;
            if state.drop_mid_body.load(Ordering::SeqCst) {
                // Socket dropped mid-body
                return Ok(());
            }
        } else if upper.starts_with("HEAD") {
            respond_head(command, state, &mut write_half).await?;
        } else if upper.starts_with("STAT") {
            let id = extract_id(command);
            let exists = state.articles.lock().unwrap().contains_key(&id);
            let reply = if exists {
                format!("223 0 <{id}>\r\n")
            } else {
                "430 no such article\r\n".to_string()
            };
            write_half.write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("POST") {
            let code = state.post_response.load(Ordering::SeqCst);
            if code != 340 {
                write_half
                    .write_all(format!("{code} posting not available\r\n").as_bytes())
                    .await?;
                continue;
            }
            write_half.write_all(b"340 send article\r\n").await?;
            let article = read_until_terminator(&mut reader).await?;
            store_posted(state, &article);
            write_half.write_all(b"240 article received\r\n").await?;
        } else if upper.starts_with("QUIT") {
            write_half.write_all(b"205 closing connection\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"500 command not recognized\r\n").await?;
        }
    }
}

async fn respond_article(
    command: &str,
    state: &State,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    with_body: bool,
) -> std::io::Result<()> {
    let id = extract_id(command);
    let article = state.articles.lock().unwrap().get(&id).cloned();
    let Some(article) = article else {
        write_half.write_all(b"430 no such article\r\n").await?;
        return Ok(());
    };

    let mut wire = format!("220 0 <{id}> article follows\r\n").into_bytes();
    for (name, value) in &article.headers {
        wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    if with_body {
        let encoded = dot_encode(&article.body);
        if state.drop_mid_body.load(Ordering::SeqCst) {
            // Emit roughly half the body, then the caller drops the socket
            let half = encoded.len() / 2;
            wire.extend_from_slice(&encoded[..half]);
            write_half.write_all(&wire).await?;
            write_half.flush().await?;
            return Ok(());
        }
        wire.extend_from_slice(&encoded);
    }
    wire.extend_from_slice(b".\r\n");
    write_half.write_all(&wire).await
}

async fn respond_head(
    command: &str,
    state: &State,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
) -> std::io::Result<()> {
    let id = extract_id(command);
    let article = state.articles.lock().unwrap().get(&id).cloned();
    let Some(article) = article else {
        write_half.write_all(b"430 no such article\r\n").await?;
        return Ok(());
    };

    let mut wire = format!("221 0 <{id}> head follows\r\n").into_bytes();
    for (name, value) in &article.headers {
        wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b".\r\n");
    write_half.write_all(&wire).await
}

async fn read_until_terminator(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        data.push(byte[0]);
        if data.ends_with(b"\r\n.\r\n") {
            data.truncate(data.len() - 5);
            return Ok(data);
        }
    }
}

fn store_posted(state: &State, wire: &[u8]) {
    let text = String::from_utf8_lossy(wire).into_owned();
    // Also index the article by its Message-ID header so round-trip tests
    // can GET it back
    if let Some((header_text, body_text)) = text.split_once("\r\n\r\n") {
        let mut headers = Vec::new();
        let mut short_id = None;
        for line in header_text.lines() {
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                if name.eq_ignore_ascii_case("message-id") {
                    short_id = Some(value.trim_matches(['<', '>']).to_string());
                }
                headers.push((name.to_string(), value.to_string()));
            }
        }
        if let Some(short_id) = short_id {
            let body = dot_decode(body_text.as_bytes());
            state
                .articles
                .lock()
                .unwrap()
                .insert(short_id, StoredArticle { headers, body });
        }
    }
    state.posted.lock().unwrap().push(text);
}

fn extract_id(command: &str) -> String {
    command
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .trim_matches(['<', '>'])
        .to_string()
}

pub fn dot_encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    if body.is_empty() {
        return out;
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
    if body.ends_with(b"\n") {
        out.truncate(out.len() - 2);
    }
    out
}

pub fn dot_decode(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    for line in wire.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}
