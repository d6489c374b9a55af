//! Loopback byte-range server: `GET /content/<id>` with an optional Range header,
//! answered from the node's stream bridge so players can seek into content still in flight.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use mesh_core::stream::{parse_range, RangeError};
use mesh_core::{ResponseHead, StreamError, StreamEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::host::{now_ms, Host};

const MAX_REQUEST: usize = 8192;
const CONTENT_PREFIX: &str = "/content/";

pub async fn run_http(host: Arc<Host>) -> io::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, host.cfg.http_port)).await?;
    info!(port = host.cfg.http_port, "range server listening on loopback");
    loop {
        let (stream, _) = listener.accept().await?;
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(host, stream).await {
                debug!(error = %e, "range client ended");
            }
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RangeRequest {
    head_only: bool,
    content_id: String,
    range: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Partial,
    Done(RangeRequest),
    Reject(u16),
}

fn parse_request(buf: &[u8]) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(status) if status.is_partial() => return Parsed::Partial,
        Ok(_) => {}
        Err(_) => return Parsed::Reject(400),
    }
    let head_only = match req.method {
        Some(m) if m.eq_ignore_ascii_case("GET") => false,
        Some(m) if m.eq_ignore_ascii_case("HEAD") => true,
        _ => return Parsed::Reject(405),
    };
    let path = req.path.unwrap_or("");
    let path = path.split('?').next().unwrap_or(path);
    let content_id = match path.strip_prefix(CONTENT_PREFIX) {
        Some(id) if !id.is_empty() && !id.contains('/') => id.to_string(),
        _ => return Parsed::Reject(404),
    };
    let range = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Range"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string());
    Parsed::Done(RangeRequest {
        head_only,
        content_id,
        range,
    })
}

async fn read_request<S: AsyncRead + Unpin>(client: &mut S) -> io::Result<Option<Parsed>> {
    let mut buf = vec![0u8; MAX_REQUEST];
    let mut filled = 0;
    loop {
        let n = client.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
        match parse_request(&buf[..filled]) {
            Parsed::Partial if filled == buf.len() => return Ok(Some(Parsed::Reject(400))),
            Parsed::Partial => continue,
            done => return Ok(Some(done)),
        }
    }
}

async fn handle_client<S: AsyncRead + AsyncWrite + Unpin>(host: Arc<Host>, mut client: S) -> io::Result<()> {
    let req = match read_request(&mut client).await? {
        None => return Ok(()),
        Some(Parsed::Done(req)) => req,
        Some(Parsed::Reject(status)) => return write_error(&mut client, status, None, reason(status)).await,
        Some(Parsed::Partial) => return Ok(()),
    };
    debug!(content = %req.content_id, range = ?req.range, head = req.head_only, "range request");

    if req.head_only {
        let head = {
            let node = host.node.lock().await;
            match node.content_meta(&req.content_id) {
                Some(meta) => parse_range(req.range.as_deref(), meta.size)
                    .map(|r| ResponseHead::new(meta, &r))
                    .map_err(StreamError::from),
                None => Err(StreamError::UnknownContent(req.content_id.clone())),
            }
        };
        return match head {
            Ok(head) => {
                client.write_all(&head_bytes(&head)).await?;
                client.flush().await
            }
            Err(e) => write_stream_error(&mut client, &e).await,
        };
    }

    let request_id = host.next_id().to_string();
    let mut events = host.register_stream(&request_id);
    let opened = host
        .node
        .lock()
        .await
        .open_stream(&request_id, &req.content_id, req.range.as_deref(), now_ms());
    let result = match opened {
        Ok(actions) => {
            host.execute(actions);
            write_events(&mut client, &mut events).await
        }
        Err(e) => write_stream_error(&mut client, &e).await,
    };
    host.unregister_stream(&request_id);
    if host.node.lock().await.cancel_stream(&request_id) {
        debug!(request = %request_id, "range client left early");
    }
    result
}

/// Relay stream events to the client until END. An error after the head was sent can only close the socket.
async fn write_events<W: AsyncWrite + Unpin>(
    client: &mut W,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
) -> io::Result<()> {
    let mut head_sent = false;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Meta { head, .. } => {
                client.write_all(&head_bytes(&head)).await?;
                head_sent = true;
            }
            StreamEvent::Data { bytes, .. } => client.write_all(&bytes).await?,
            StreamEvent::End { .. } => return client.flush().await,
            StreamEvent::Error { status, message, .. } => {
                if head_sent {
                    return Err(io::Error::new(io::ErrorKind::Other, message));
                }
                return write_error(client, status, None, &message).await;
            }
        }
    }
    Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))
}

fn head_bytes(head: &ResponseHead) -> Vec<u8> {
    let mut s = format!("HTTP/1.1 {} {}\r\n", head.status, reason(head.status));
    for (name, value) in &head.headers {
        s.push_str(&format!("{}: {}\r\n", name, value));
    }
    s.push_str("Connection: close\r\n\r\n");
    s.into_bytes()
}

async fn write_stream_error<W: AsyncWrite + Unpin>(client: &mut W, e: &StreamError) -> io::Result<()> {
    let content_range = match e {
        StreamError::Range(RangeError::Unsatisfiable { size }) => Some(format!("bytes */{}", size)),
        _ => None,
    };
    write_error(client, e.status(), content_range, &e.to_string()).await
}

async fn write_error<W: AsyncWrite + Unpin>(
    client: &mut W,
    status: u16,
    content_range: Option<String>,
    message: &str,
) -> io::Result<()> {
    let mut s = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n",
        status,
        reason(status),
        message.len()
    );
    if let Some(cr) = content_range {
        s.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    s.push_str("Connection: close\r\n\r\n");
    s.push_str(message);
    client.write_all(s.as_bytes()).await?;
    client.flush().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        _ => "Internal Server Error",
    }
}
