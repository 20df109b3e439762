use crate::codec;
use crate::protocol::{
    CRLF, HeadError, Response, Status, TERMINATOR, Verb, find_terminator, header, parse_head,
};
use anyhow::{Context, Result, anyhow, bail};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

const READ_CHUNK: usize = 8192;

pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub download_dir: PathBuf,
    pub quiet: bool,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed before any response arrived")]
    NoResponse,
    #[error("connection closed after {0} bytes of an incomplete response")]
    Truncated(usize),
    #[error("timed out waiting for response")]
    Timeout,
    #[error("invalid {name} header: {value:?}")]
    InvalidCount { name: &'static str, value: String },
    #[error(transparent)]
    Head(#[from] HeadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reassembles responses from a byte stream that may deliver them in pieces.
///
/// A response ends at its blank-line terminator unless it declares
/// `Encoded-Size`, in which case that many body bytes must follow. A `200`
/// answer to FIND is held until `Matched-Files` lines of body have arrived.
/// Bytes beyond the end of a response are kept for the next one.
pub struct ResponseReader<R> {
    reader: R,
    buf: Vec<u8>,
    timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R) -> Self {
        ResponseReader {
            reader,
            buf: Vec::new(),
            timeout: None,
        }
    }

    /// Bounds every individual read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reads one response. `verb` is the verb of the request it answers, or
    /// `None` if the request named no known verb.
    pub async fn read_response(&mut self, verb: Option<Verb>) -> Result<Response, FrameError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            self.skip_body_trailer();
            if let Some(response) = self.take_frame(verb)? {
                return Ok(response);
            }

            let n = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.reader.read(&mut chunk))
                    .await
                    .map_err(|_| FrameError::Timeout)??,
                None => self.reader.read(&mut chunk).await?,
            };
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    FrameError::NoResponse
                } else {
                    FrameError::Truncated(self.buf.len())
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Drops the `\r\n` that trails a body when it arrived after the body was
    /// already complete.
    fn skip_body_trailer(&mut self) {
        let mut start = 0;
        while self.buf[start..].starts_with(CRLF.as_bytes()) {
            start += CRLF.len();
        }
        if start > 0 {
            self.buf.drain(..start);
        }
    }

    fn take_frame(&mut self, verb: Option<Verb>) -> Result<Option<Response>, FrameError> {
        let Some(head_end) = find_terminator(&self.buf) else {
            return Ok(None);
        };
        let head = parse_head(&self.buf[..head_end])?;
        let status = Status::parse(&head.start_line)?;
        let body_start = head_end + TERMINATOR.len();
        let received = &self.buf[body_start..];

        let body_len = if let Some(value) = head.headers.get(header::ENCODED_SIZE) {
            let declared = parse_count(header::ENCODED_SIZE, value)?;
            if received.len() < declared {
                return Ok(None);
            }
            Some(declared)
        } else if verb == Some(Verb::Find) && status.is_success() {
            match head.headers.get(header::MATCHED_FILES) {
                Some(value) => {
                    let lines = parse_count(header::MATCHED_FILES, value)?;
                    match line_block_len(received, lines) {
                        Some(len) => Some(len),
                        None => return Ok(None),
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let frame_end = body_start + body_len.unwrap_or(0);
        let rest = self.buf.split_off(frame_end);
        let frame = std::mem::replace(&mut self.buf, rest);
        let body = body_len.map(|_| frame[body_start..].to_vec());
        debug!(status = status.code, body = body_len, "response framed");

        Ok(Some(Response {
            status,
            headers: head.headers,
            body,
        }))
    }
}

fn parse_count(name: &'static str, value: &str) -> Result<usize, FrameError> {
    value.trim().parse().map_err(|_| FrameError::InvalidCount {
        name,
        value: value.to_string(),
    })
}

/// Length of the first `lines` CRLF-terminated lines of `data`, if present.
fn line_block_len(data: &[u8], lines: usize) -> Option<usize> {
    let mut end = 0;
    for _ in 0..lines {
        let offset = data[end..].windows(2).position(|w| w == b"\r\n")?;
        end += offset + 2;
    }
    Some(end)
}

pub async fn run_client(config: ClientConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    if !config.quiet {
        println!("Connecting to {}...", addr);
    }
    let socket = tokio::time::timeout(config.timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow!("Timed out connecting to {}", addr))?
        .with_context(|| format!("Connection to {} failed", addr))?;
    socket.set_nodelay(true)?;
    if !config.quiet {
        println!("Connected to server.");
    }

    let (read_half, mut write_half) = socket.into_split();
    let mut responses = ResponseReader::new(read_half).with_timeout(config.timeout);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = input.next_line().await? else {
            break;
        };
        let command = line.trim_end_matches('\r');
        if command.is_empty() {
            continue;
        }

        write_half
            .write_all(format!("{}\r\n\r\n", command).as_bytes())
            .await
            .context("Failed to send command")?;

        let verb = Verb::of_line(command);
        let response = responses
            .read_response(verb)
            .await
            .context("Failed to receive response or connection closed by server")?;

        match verb {
            Some(Verb::Helo) => {
                if !config.quiet {
                    println!("Server response:\n{}", response);
                }
            }
            Some(Verb::Find) => {
                if config.quiet {
                    print!("{}", response.body_text());
                } else {
                    println!("{}", response);
                }
            }
            Some(Verb::Get) => {
                if response.status.is_success() {
                    if let Err(e) = save_download(&response, &config.download_dir, config.quiet).await {
                        error!("{:#}", e);
                    }
                } else if config.quiet {
                    eprintln!("{}", response.error_message().unwrap_or("request failed"));
                } else {
                    println!("Error response: {}", response);
                }
            }
            Some(Verb::End) => {
                if !config.quiet {
                    println!("Server response:\n{}", response);
                }
                break;
            }
            None => {
                if response.status.code == Status::NOT_IMPLEMENTED {
                    warn!(command, "command not implemented by node");
                }
                if !config.quiet {
                    println!("Unknown command. Server response:\n{}", response);
                }
            }
        }
    }

    Ok(())
}

/// Decodes a successful GET response and writes it under `download_dir`.
pub async fn save_download(response: &Response, download_dir: &Path, quiet: bool) -> Result<PathBuf> {
    let file_name = response
        .headers
        .get(header::FILE_NAME)
        .context("File-Name header not found in response")?;
    let file_size: usize = response
        .headers
        .get(header::FILE_SIZE)
        .and_then(|v| v.parse().ok())
        .context("Invalid file size information in response")?;
    let encoded = response.body.as_deref().unwrap_or_default();
    let target = download_target(download_dir, file_name)?;

    if !quiet {
        println!("Encoded data size: {} bytes", encoded.len());
        let preview = &encoded[..encoded.len().min(20)];
        println!("First 20 chars of encoded data: {}", String::from_utf8_lossy(preview));
    }

    let decoded = codec::decode(encoded).context("Failed to decode base64 data")?;
    if decoded.len() != file_size {
        bail!(
            "Decoded {} bytes but File-Size is {}",
            decoded.len(),
            file_size
        );
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory for: {}", target.display()))?;
    }
    if !quiet {
        println!("Saving file to: {} ({} bytes)", target.display(), decoded.len());
    }
    fs::write(&target, &decoded)
        .await
        .with_context(|| format!("Failed to open file for writing: {}", target.display()))?;
    Ok(target)
}

/// Joins a node-supplied relative name onto the download directory,
/// refusing names that would land outside it.
fn download_target(download_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let relative = Path::new(file_name);
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("Refusing to save outside download directory: {:?}", file_name);
    }
    Ok(download_dir.join(relative))
}
