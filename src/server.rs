use crate::codec;
use crate::index::{FileIndex, Pattern};
use crate::protocol::{
    Request, RequestError, Response, TERMINATOR, find_terminator, header, parse_head,
};
use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Longest request block accepted before the terminator must appear.
const MAX_REQUEST_LEN: usize = 8192;
/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct NodeConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub root: PathBuf,
    pub idle_timeout: Duration,
}

/// Everything a connection needs to answer requests. Built once at startup.
pub struct NodeContext {
    index: FileIndex,
    port: u16,
}

/// Whether the connection stays open after a response is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

impl NodeContext {
    pub fn new(index: FileIndex, port: u16) -> Self {
        NodeContext { index, port }
    }

    pub async fn dispatch(&self, request: &Request) -> (Response, Flow) {
        debug!(verb = ?request.verb(), ?request, "dispatching");
        match request {
            Request::Greet => (self.greet(), Flow::Continue),
            Request::Find(pattern) => (self.find(pattern), Flow::Continue),
            Request::Get(id) => (self.get(*id).await, Flow::Continue),
            Request::End => (Response::ok(), Flow::Close),
            Request::Unknown(_) => (Response::bad_request("Unknown command"), Flow::Continue),
        }
    }

    fn greet(&self) -> Response {
        Response::ok()
            .header(header::PORT, self.port)
            .header(header::CONTENT_DIRECTORY, self.index.root().display())
            .header(header::INDEXED_FILES, self.index.len())
    }

    fn find(&self, raw: &str) -> Response {
        let pattern = match Pattern::parse(raw) {
            Ok(pattern) => pattern,
            Err(e) => return Response::bad_request(e),
        };

        let mut body = String::new();
        let mut matched = 0usize;
        for (id, entry) in self.index.find(&pattern) {
            body.push_str(&format!(
                "{};{};{};{}\r\n",
                id,
                entry.relative_path,
                entry.size,
                entry.date()
            ));
            matched += 1;
        }

        Response::ok()
            .header(header::SEARCH_PATTERN, raw)
            .header(header::MATCHED_FILES, matched)
            .with_body(body)
    }

    async fn get(&self, id: u64) -> Response {
        let Some(entry) = self.index.get(id) else {
            return Response::bad_request(RequestError::InvalidFileNumber);
        };
        let path = self.index.full_path(entry);

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open indexed file");
                return Response::bad_request("Cannot open file");
            }
        };

        let mut content = Vec::new();
        let reserved = usize::try_from(entry.size)
            .ok()
            .filter(|&len| content.try_reserve_exact(len).is_ok());
        let Some(len) = reserved else {
            return Response::bad_request("Memory allocation failed");
        };
        content.resize(len, 0);
        if let Err(e) = file.read_exact(&mut content).await {
            warn!(path = %path.display(), error = %e, "short read on indexed file");
            return Response::bad_request("Failed to read file");
        }

        let encoded = codec::encode(&content);
        Response::ok()
            .header(header::REQUEST_FILE, id)
            .header(header::FILE_NAME, &entry.relative_path)
            .header(header::FILE_SIZE, entry.size)
            .header(header::FILE_DATE, entry.date())
            .header(header::ENCODED_SIZE, codec::encoded_len(content.len()))
            .with_body(encoded)
    }
}

pub async fn run_server(config: NodeConfig) -> Result<()> {
    info!(root = %config.root.display(), "indexing files");
    let index = FileIndex::build(&config.root);
    if index.is_empty() {
        warn!(root = %config.root.display(), "no files indexed");
    }
    info!(files = index.len(), "index built");

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let port = listener.local_addr()?.port();
    info!(%addr, "node listening");

    serve(listener, NodeContext::new(index, port), config.idle_timeout).await
}

/// Serves one connection at a time until the listener fails.
pub async fn serve(listener: TcpListener, ctx: NodeContext, idle_timeout: Duration) -> Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        info!(%peer, "client connected");
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, error = %e, "cannot set TCP_NODELAY");
        }
        if let Err(e) = handle_connection(socket, &ctx, idle_timeout).await {
            warn!(%peer, error = %e, "connection error");
        }
        info!(%peer, "client disconnected");
    }
}

enum Inbound {
    Request(Request),
    Invalid(RequestError),
    Closed,
    TimedOut,
}

async fn handle_connection<S>(mut socket: S, ctx: &NodeContext, idle_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        let (response, flow) = match read_request(&mut socket, &mut buf, idle_timeout).await? {
            Inbound::Request(request) => ctx.dispatch(&request).await,
            Inbound::Invalid(e) => (Response::bad_request(e), Flow::Continue),
            Inbound::Closed => return Ok(()),
            Inbound::TimedOut => {
                info!("client timed out");
                return Ok(());
            }
        };
        let delivered = send_response(&mut socket, &response, idle_timeout).await?;
        if delivered == Flow::Close || flow == Flow::Close {
            return Ok(());
        }
    }
}

/// Reads until a full request block is buffered. Bytes past the block stay
/// in `buf` for the next call.
async fn read_request<S>(socket: &mut S, buf: &mut Vec<u8>, idle_timeout: Duration) -> Result<Inbound>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_terminator(buf) {
            let block: Vec<u8> = buf.drain(..end + TERMINATOR.len()).collect();
            let inbound = match parse_head(&block[..end]) {
                Ok(head) => match Request::parse(&head.start_line) {
                    Ok(request) => Inbound::Request(request),
                    Err(e) => Inbound::Invalid(e),
                },
                Err(_) => Inbound::Invalid(RequestError::Malformed),
            };
            return Ok(inbound);
        }
        if buf.len() > MAX_REQUEST_LEN {
            buf.clear();
            return Ok(Inbound::Invalid(RequestError::Malformed));
        }

        let read = tokio::time::timeout(idle_timeout, socket.read_buf(buf)).await;
        match read {
            Err(_) => return Ok(Inbound::TimedOut),
            Ok(Ok(0)) => return Ok(Inbound::Closed),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Writes one response. A peer that stops reading for `idle_timeout` gets
/// its connection closed.
async fn send_response<S>(socket: &mut S, resp: &Response, idle_timeout: Duration) -> Result<Flow>
where
    S: AsyncWrite + Unpin,
{
    let bytes = resp.to_bytes();
    let write = async {
        socket.write_all(&bytes).await?;
        socket.flush().await
    };
    match tokio::time::timeout(idle_timeout, write).await {
        Ok(result) => {
            result?;
            Ok(Flow::Continue)
        }
        Err(_) => {
            info!("client timed out");
            Ok(Flow::Close)
        }
    }
}
