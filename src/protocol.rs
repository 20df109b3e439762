//! Wire format shared by the node and the client.
//!
//! A request is a single line `VERB [args]` followed by a blank line. A
//! response is a status line, `Key: value` header lines, a blank line and an
//! optional body; a body is always followed by one extra `\r\n`.

use std::fmt;

use thiserror::Error;

pub const CRLF: &str = "\r\n";
/// Ends every request and every header block.
pub const TERMINATOR: &[u8] = b"\r\n\r\n";

pub mod header {
    pub const PORT: &str = "Port";
    pub const CONTENT_DIRECTORY: &str = "Content-Directory";
    pub const INDEXED_FILES: &str = "Indexed-Files";
    pub const SEARCH_PATTERN: &str = "Search-Pattern";
    pub const MATCHED_FILES: &str = "Matched-Files";
    pub const REQUEST_FILE: &str = "Request-File";
    pub const FILE_NAME: &str = "File-Name";
    pub const FILE_SIZE: &str = "File-Size";
    pub const FILE_DATE: &str = "File-Date";
    pub const ENCODED_SIZE: &str = "Encoded-Size";
    pub const ERROR: &str = "Error";
}

/// Position of the first blank-line terminator in `buf`.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Helo,
    Find,
    Get,
    End,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Helo => "HELO",
            Verb::Find => "FIND",
            Verb::Get => "GET",
            Verb::End => "END",
        }
    }

    /// Case-sensitive match of a single token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HELO" => Some(Verb::Helo),
            "FIND" => Some(Verb::Find),
            "GET" => Some(Verb::Get),
            "END" => Some(Verb::End),
            _ => None,
        }
    }

    /// Verb of a request line, if it names one.
    pub fn of_line(line: &str) -> Option<Self> {
        Self::from_token(split_verb(line).0)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn split_verb(line: &str) -> (&str, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(|c: char| c.is_ascii_whitespace()) {
        Some((verb, rest)) => (verb, rest),
        None => (line, ""),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Malformed command")]
    Malformed,
    #[error("Missing search pattern")]
    MissingPattern,
    #[error("Missing file number")]
    MissingFileNumber,
    #[error("Invalid file number")]
    InvalidFileNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Greet,
    Find(String),
    Get(u64),
    End,
    Unknown(String),
}

impl Request {
    /// Parses one request line; a trailing line terminator is ignored.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let (verb, rest) = split_verb(line);
        let Some(verb) = Verb::from_token(verb) else {
            return Ok(Request::Unknown(line.trim_end_matches(['\r', '\n']).to_string()));
        };
        let rest = rest.trim_start();
        match verb {
            Verb::Helo => Ok(Request::Greet),
            Verb::End => Ok(Request::End),
            Verb::Find if rest.is_empty() => Err(RequestError::MissingPattern),
            Verb::Find => Ok(Request::Find(rest.to_string())),
            Verb::Get if rest.is_empty() => Err(RequestError::MissingFileNumber),
            Verb::Get => rest
                .trim_end()
                .parse()
                .map(Request::Get)
                .map_err(|_| RequestError::InvalidFileNumber),
        }
    }

    pub fn verb(&self) -> Option<Verb> {
        match self {
            Request::Greet => Some(Verb::Helo),
            Request::Find(_) => Some(Verb::Find),
            Request::Get(_) => Some(Verb::Get),
            Request::End => Some(Verb::End),
            Request::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadError {
    #[error("header block is not valid UTF-8")]
    NotUtf8,
    #[error("empty header block")]
    Empty,
    #[error("malformed status line: {0:?}")]
    MalformedStatus(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
}

/// Ordered `Key: value` pairs. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.push((key.into(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// First line plus headers of a request or response, terminator excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub start_line: String,
    pub headers: Headers,
}

pub fn parse_head(block: &[u8]) -> Result<Head, HeadError> {
    let text = std::str::from_utf8(block).map_err(|_| HeadError::NotUtf8)?;
    let mut lines = text.split(CRLF);
    let start_line = match lines.next() {
        Some(line) if !line.is_empty() => line.to_string(),
        _ => return Err(HeadError::Empty),
    };

    let mut headers = Headers::default();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            return Err(HeadError::MalformedHeader(line.to_string()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(HeadError::MalformedHeader(line.to_string()));
        }
        headers.push(key, value.trim());
    }

    Ok(Head {
        start_line,
        headers,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
}

impl Status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_IMPLEMENTED: u16 = 501;

    pub fn ok() -> Self {
        Status {
            code: Self::OK,
            reason: "OK".into(),
        }
    }

    pub fn bad_request() -> Self {
        Status {
            code: Self::BAD_REQUEST,
            reason: "Bad Request".into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn parse(line: &str) -> Result<Self, HeadError> {
        let malformed = || HeadError::MalformedStatus(line.to_string());
        let (code, reason) = line.split_once(' ').unwrap_or((line, ""));
        let code = code.parse().map_err(|_| malformed())?;
        Ok(Status {
            code,
            reason: reason.to_string(),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Response {
            status,
            headers: Headers::default(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::ok())
    }

    /// `400` carrying `message` in the `Error` header.
    pub fn bad_request(message: impl ToString) -> Self {
        Self::new(Status::bad_request()).header(header::ERROR, message)
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push(key, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.headers.get(header::ERROR)
    }

    pub fn body_text(&self) -> String {
        self.body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{}{CRLF}", self.status);
        for (key, value) in self.headers.iter() {
            out.push_str(&format!("{key}: {value}{CRLF}"));
        }
        out.push_str(CRLF);
        let mut out = out.into_bytes();
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
            out.extend_from_slice(CRLF.as_bytes());
        }
        out
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
