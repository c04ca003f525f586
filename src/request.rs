/*!
Reading and interpreting a client's request line and header block.
*/
use std::borrow::Cow;

use http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Version,
};
use tokio::io::AsyncBufRead;

use crate::{
    cfg::Cfg,
    date::parse_http_date,
    header::{is_blank, read_line_bounded, Field, HeaderScanner, Line},
    LbErr,
};

/// A `Range: bytes=...` request. Only the first range of a list is honoured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeSpec {
    /// `bytes=START-END` (inclusive) or `bytes=START-` (`end` is `None`).
    From { start: u64, end: Option<u64> },
    /// `bytes=-N`: the last `N` bytes.
    Suffix(u64),
}

/// Leading decimal digits as a number; no digits reads as 0.
fn leading_number(s: &str) -> (u64, &str) {
    let n_digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    let (digits, rest) = s.split_at(n_digits);
    let n = digits.bytes().fold(0u64, |acc, b| {
        acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
    });
    (n, rest)
}

impl RangeSpec {
    pub fn parse(val: &str) -> Option<RangeSpec> {
        let val = val.trim();
        match val.as_bytes().get(..6) {
            Some(unit) if unit.eq_ignore_ascii_case(b"bytes=") => {}
            _ => return None,
        }
        let first = val.get(6..)?.split(',').next().unwrap_or("").trim();

        if let Some(suffix) = first.strip_prefix('-') {
            let (n, _) = leading_number(suffix.trim_start());
            return Some(RangeSpec::Suffix(n));
        }

        let (start, rest) = leading_number(first);
        let end = match rest.trim_start().strip_prefix('-') {
            Some(end) => {
                let end = end.trim_start();
                if end.starts_with(|c: char| c.is_ascii_digit()) {
                    Some(leading_number(end).0)
                } else {
                    None
                }
            }
            None => None,
        };
        Some(RangeSpec::From { start, end })
    }
}

/// The three parts of a request line.
#[derive(Debug, Eq, PartialEq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: Version,
}

/**
Split and validate a request line.

`connect` says whether CONNECT is among the methods this server answers.
*/
pub fn parse_request_line(line: &[u8], connect: bool) -> Result<RequestLine, LbErr> {
    let text = std::str::from_utf8(line).map_err(|_| {
        LbErr::from(StatusCode::BAD_REQUEST).wrap("Request line is not valid UTF-8.")
    })?;
    let mut parts = text.split_ascii_whitespace();
    let (meth, target, vers) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(LbErr::from(StatusCode::BAD_REQUEST)
                .wrap(format!("Malformed request line: {:?}", text.trim_end())));
        }
    };

    let method = match meth {
        "GET" => Method::GET,
        "HEAD" => Method::HEAD,
        "POST" => Method::POST,
        "CONNECT" if connect => Method::CONNECT,
        _ => {
            let allow = if connect {
                "GET, HEAD, POST, CONNECT"
            } else {
                "GET, HEAD, POST"
            };
            return Err(LbErr::from(StatusCode::METHOD_NOT_ALLOWED)
                .with_header("Allow", allow)
                .wrap(format!("Unsupported method {:?}", meth)));
        }
    };

    let version = match vers {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        _ => {
            return Err(LbErr::from(StatusCode::HTTP_VERSION_NOT_SUPPORTED)
                .wrap(format!("Unsupported version {:?}", vers)));
        }
    };

    if method != Method::CONNECT && !target.starts_with('/') {
        return Err(LbErr::from(StatusCode::BAD_REQUEST)
            .wrap(format!("Target {:?} is not an absolute path.", target)));
    }

    Ok(RequestLine {
        method,
        target: target.to_string(),
        version,
    })
}

/**
Decode a request target into a filesystem-relative path and a query string.

The query is everything after the first `?`, left encoded. The path is
percent-decoded (malformed escapes pass through untouched), then runs of
`/` collapse, `/./` collapses, and a `.` at the start of any segment becomes
`:` so no segment can name `..` or a hidden file.
*/
pub fn demangle(target: &str) -> (Vec<u8>, Option<String>) {
    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (target, None),
    };

    let decoded = urlencoding::decode_binary(raw_path.as_bytes());
    let mut d: Vec<u8> = Vec::with_capacity(decoded.len());
    for &c in decoded.iter() {
        d.push(c);
        let n = d.len();
        if n > 2 && d[n - 1] == b'/' && d[n - 2] == b':' && d[n - 3] == b'/' {
            d.truncate(n - 2);
        } else if n > 1 && d[n - 1] == b'/' && d[n - 2] == b'/' {
            d.pop();
        } else if n > 1 && d[n - 1] == b'.' && d[n - 2] == b'/' {
            d[n - 1] = b':';
        }
    }

    if d.first() != Some(&b'/') {
        d.insert(0, b'/');
    }
    (d, query)
}

/**
Everything the server needs to know about one request.

One of these is built per request and dropped when its response is done;
nothing in it survives into the next request on the connection.
*/
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// The target exactly as the client sent it.
    pub target: String,
    /// Decoded, demangled path; always starts with `/`.
    pub path: Vec<u8>,
    pub query: Option<String>,
    pub version: Version,
    /// Every header, last occurrence winning.
    pub headers: HeaderMap,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub range: Option<RangeSpec>,
    /// Unix time from `If-Modified-Since`; 0 if absent or unparseable.
    pub if_modified_since: i64,
    pub keep_alive: bool,
}

impl Request {
    pub fn from_parts(line: RequestLine, fields: Vec<Field>, cfg: &Cfg) -> Result<Request, LbErr> {
        log::trace!("Request::from_parts( {:?}, [{} fields] ) called.", &line, fields.len());

        let mut headers = HeaderMap::with_capacity(fields.len());
        for f in fields.iter() {
            let name = match HeaderName::from_bytes(f.name.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    return Err(LbErr::from(StatusCode::BAD_REQUEST)
                        .wrap(format!("Invalid header name {:?}", &f.name)));
                }
            };
            let val = match HeaderValue::from_bytes(&f.value) {
                Ok(val) => val,
                Err(_) => {
                    return Err(LbErr::from(StatusCode::BAD_REQUEST)
                        .wrap(format!("Invalid value for header {:?}", &f.name)));
                }
            };
            headers.insert(name, val);
        }

        let (path, query) = if line.method == Method::CONNECT {
            (line.target.as_bytes().to_vec(), None)
        } else {
            demangle(&line.target)
        };

        let text = |name: &str| -> Option<String> {
            headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        };

        let content_length = match headers.get("content-length") {
            None => 0,
            Some(v) => match std::str::from_utf8(v.as_bytes())
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
            {
                Some(n) => n,
                None => {
                    return Err(LbErr::from(StatusCode::BAD_REQUEST)
                        .wrap(format!("Invalid Content-Length: {:?}", v)));
                }
            },
        };
        if content_length > cfg.max_post_body {
            return Err(LbErr::from(StatusCode::PAYLOAD_TOO_LARGE).wrap(format!(
                "Declared body of {} bytes exceeds limit of {}.",
                content_length, cfg.max_post_body
            )));
        }

        let mut keep_alive = line.version == Version::HTTP_11;
        if let Some(v) = headers.get("connection") {
            let v = String::from_utf8_lossy(v.as_bytes());
            for token in v.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }

        let range = text("range").and_then(|v| RangeSpec::parse(&v));
        let if_modified_since = text("if-modified-since")
            .map(|v| parse_http_date(&v))
            .unwrap_or(0);

        Ok(Request {
            host: text("host"),
            user_agent: text("user-agent"),
            referer: text("referer"),
            content_type: text("content-type"),
            method: line.method,
            target: line.target,
            version: line.version,
            path,
            query,
            headers,
            content_length,
            range,
            if_modified_since,
            keep_alive,
        })
    }

    pub fn header_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
    }

    /// Whether `Accept-Encoding` lists gzip.
    pub fn accepts_gzip(&self) -> bool {
        match self.headers.get("accept-encoding") {
            Some(v) => String::from_utf8_lossy(v.as_bytes())
                .split(',')
                .map(|tok| tok.split(';').next().unwrap_or("").trim())
                .any(|tok| tok.eq_ignore_ascii_case("gzip")),
            None => false,
        }
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }
}

/**
Read the next request line, skipping blank lines before it.

`Ok(None)` means the client closed the connection cleanly between
requests. I/O errors come back as hangups.
*/
pub async fn read_request_line<R>(r: &mut R, max: usize) -> Result<Option<Vec<u8>>, LbErr>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::with_capacity(256);
    loop {
        line.clear();
        let res = read_line_bounded(r, &mut line, max)
            .await
            .map_err(|e| LbErr::hangup(format!("Error reading request line: {}", &e)))?;
        match res {
            Ok(Line::Eof) => return Ok(None),
            Ok(Line::Truncated) => {
                return Err(LbErr::hangup("Client closed connection inside request line."));
            }
            Ok(Line::Full(_)) if is_blank(&line) => continue,
            Ok(Line::Full(_)) => return Ok(Some(line)),
            Err(_) => {
                return Err(LbErr::from(StatusCode::BAD_REQUEST)
                    .wrap(format!("Request line longer than {} bytes.", max)));
            }
        }
    }
}

/// Read the header block following a request line.
pub async fn read_header_fields<R>(r: &mut R, cfg: &Cfg) -> Result<Vec<Field>, LbErr>
where
    R: AsyncBufRead + Unpin,
{
    let res = HeaderScanner::new(cfg.header_limits())
        .read_block(r)
        .await
        .map_err(|e| LbErr::hangup(format!("Error reading headers: {}", &e)))?;
    match res {
        Ok(Some(fields)) => Ok(fields),
        Ok(None) => Err(LbErr::hangup("Client closed connection inside header block.")),
        Err(e) => Err(LbErr::from(e)),
    }
}
