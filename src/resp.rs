/*!
Response heads, and the canned HTML bodies that go with error responses.
*/
use std::{borrow::Cow, fmt::Debug};

use http::{header::HeaderValue, StatusCode, Version};
use smallvec::SmallVec;

use crate::{HeaderPair, LbErr, SERVER};

static CANNED_HEAD: &str = include_str!("response_files/canned_head.html");
static CANNED_MIDDLE: &str = include_str!("response_files/canned_middle.html");
static CANNED_FOOT: &str = include_str!("response_files/canned_foot.html");
static CANNED_BASE_RESPONSE_LEN: usize =
    CANNED_HEAD.len() + CANNED_MIDDLE.len() + CANNED_FOOT.len();

static R_400: (&str, &str) = (
    "Bad Request (400)",
    "<h1>Bad Request (400)</h1>
<p>Your browser sent a request this server could not understand.</p>",
);
static R_404: (&str, &str) = (
    "Not Found (404)",
    "<h1>Not Found (404)</h1>
<p>There is no resource available at the URI you requested.</p>",
);
static R_405: (&str, &str) = (
    "Method Not Allowed (405)",
    "<h1>Method Not Allowed (405)</h1>
<p>The requested HTTP method may not be used with the requested URI.</p>",
);
static R_408: (&str, &str) = (
    "Request Timeout (408)",
    "<h1>Request Timeout (408)</h1>
<p>Your request took too long to arrive.</p>",
);
static R_413: (&str, &str) = (
    "Payload Too Large (413)",
    "<h1>Payload Too Large (413)</h1>
<p>The request you sent is too large.</p>",
);
static R_416: (&str, &str) = (
    "Range Not Satisfiable (416)",
    "<h1>Range Not Satisfiable (416)</h1>
<p>The requested range lies outside the resource.</p>",
);
static R_431: (&str, &str) = (
    "Request Header Fields Too Large (431)",
    "<h1>Request Header Fields Too Large (431)</h1>
<p>The headers of your request are too large.</p>",
);
static R_500: (&str, &str) = (
    "Internal Server Error (500)",
    "<h1>Internal Server Error (500)</h1>
<p>There was an error attempting to fetch the resource you requested.</p>",
);
static R_502: (&str, &str) = (
    "Bad Gateway (502)",
    "<h1>Bad Gateway (502)</h1>
<p>The program responsible for this resource did not answer properly.</p>",
);
static R_504: (&str, &str) = (
    "Gateway Timeout (504)",
    "<h1>Gateway Timeout (504)</h1>
<p>The program responsible for this resource took too long to answer.</p>",
);
static R_505: (&str, &str) = (
    "HTTP Version Not Supported (505)",
    "<h1>HTTP Version Not Supported (505)</h1>
<p>This server speaks HTTP/1.0 and HTTP/1.1 only.</p>",
);

static OTHER: (&str, &str) = (
    "Error",
    "<h1>Error</h1>
<p>There was an error attempting to fetch your resource.</p>",
);

/// Status line text for a version; anything but 1.1 answers as 1.0.
pub fn version_str(v: Version) -> &'static str {
    if v == Version::HTTP_11 {
        "HTTP/1.1"
    } else {
        "HTTP/1.0"
    }
}

/**
Everything in a response before the body.

`Server` and `Connection` are added by `encode`; a head built with
`location_only` gets neither, and carries nothing but its `Location`.
*/
#[derive(Clone, Debug)]
pub struct ResponseHead {
    code: StatusCode,
    reason: Option<String>,
    headers: SmallVec<[HeaderPair; 8]>,
    bare: bool,
}

impl ResponseHead {
    pub fn new(code: StatusCode) -> ResponseHead {
        ResponseHead {
            code,
            reason: None,
            headers: SmallVec::new(),
            bare: false,
        }
    }

    /// The head of a CGI `Location:` redirect.
    pub fn location_only(location: HeaderValue) -> ResponseHead {
        let mut head = ResponseHead::new(StatusCode::FOUND);
        head.bare = true;
        head.push(Cow::Borrowed("Location"), location);
        head
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> ResponseHead {
        self.reason = Some(reason.into());
        self
    }

    pub fn header<V>(mut self, name: &'static str, v: V) -> ResponseHead
    where
        V: TryInto<HeaderValue>,
        V::Error: Debug,
    {
        match v.try_into() {
            Ok(v) => self.push(Cow::Borrowed(name), v),
            Err(e) => log::error!("Unable to set header {}: {:?}", name, &e),
        }
        self
    }

    pub fn push(&mut self, name: Cow<'static, str>, v: HeaderValue) {
        self.headers.push((name, v));
    }

    pub fn headers(&self) -> &[HeaderPair] {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn encode(&self, version: Version, keep_alive: bool) -> Vec<u8> {
        let reason = match &self.reason {
            Some(r) => r.as_str(),
            None => self.code.canonical_reason().unwrap_or(""),
        };

        let mut v: Vec<u8> = Vec::with_capacity(256);
        v.extend_from_slice(version_str(version).as_bytes());
        v.push(b' ');
        v.extend_from_slice(self.code.as_str().as_bytes());
        if !reason.is_empty() {
            v.push(b' ');
            v.extend_from_slice(reason.as_bytes());
        }
        v.extend_from_slice(b"\r\n");

        if !self.bare {
            push_line(&mut v, "Server", SERVER.as_bytes());
            let conn: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
            push_line(&mut v, "Connection", conn);
        }
        for (name, val) in self.headers.iter() {
            push_line(&mut v, name, val.as_bytes());
        }
        v.extend_from_slice(b"\r\n");
        v
    }
}

fn push_line(v: &mut Vec<u8>, name: &str, val: &[u8]) {
    v.extend_from_slice(name.as_bytes());
    v.extend_from_slice(b": ");
    v.extend_from_slice(val);
    v.extend_from_slice(b"\r\n");
}

/// The HTML page sent along with an error status.
pub fn canned_html(code: StatusCode) -> Vec<u8> {
    let (title, contents) = match code {
        StatusCode::BAD_REQUEST => R_400,
        StatusCode::NOT_FOUND => R_404,
        StatusCode::METHOD_NOT_ALLOWED => R_405,
        StatusCode::REQUEST_TIMEOUT => R_408,
        StatusCode::PAYLOAD_TOO_LARGE => R_413,
        StatusCode::RANGE_NOT_SATISFIABLE => R_416,
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE => R_431,
        StatusCode::INTERNAL_SERVER_ERROR => R_500,
        StatusCode::BAD_GATEWAY => R_502,
        StatusCode::GATEWAY_TIMEOUT => R_504,
        StatusCode::HTTP_VERSION_NOT_SUPPORTED => R_505,
        _ => OTHER,
    };

    let mut v: Vec<u8> =
        Vec::with_capacity(CANNED_BASE_RESPONSE_LEN + title.len() + contents.len());
    v.extend_from_slice(CANNED_HEAD.as_bytes());
    v.extend_from_slice(title.as_bytes());
    v.extend_from_slice(CANNED_MIDDLE.as_bytes());
    v.extend_from_slice(contents.as_bytes());
    v.extend_from_slice(CANNED_FOOT.as_bytes());
    v
}

/**
A complete error response: head, and the canned page unless `with_body` is
false (HEAD requests). Error responses always close the connection.
*/
pub fn error_response(err: &LbErr, version: Version, with_body: bool) -> Vec<u8> {
    log::trace!("error_response( {}, {:?}, {} ) called.", err.code(), version, with_body);

    let body = canned_html(err.code());
    let mut head = ResponseHead::new(err.code())
        .header("Content-Type", "text/html; charset=UTF-8")
        .header("Content-Length", body.len());
    for (name, val) in err.headers().iter() {
        head.push(name.clone(), val.clone());
    }

    let mut v = head.encode(version, false);
    if with_body {
        v.extend_from_slice(&body);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_head() {
        let head = ResponseHead::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .header("Content-Length", 5u64);
        let bytes = head.encode(Version::HTTP_11, true);
        let expected = format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\nConnection: keep-alive\r\n\
             Content-Type: text/plain\r\nContent-Length: 5\r\n\r\n",
            SERVER.as_str()
        );
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn custom_reason_and_old_version() {
        let head = ResponseHead::new(StatusCode::CREATED).with_reason("Made It");
        let bytes = head.encode(Version::HTTP_09, false);
        assert!(bytes.starts_with(b"HTTP/1.0 201 Made It\r\n"));
        assert!(String::from_utf8_lossy(&bytes).contains("Connection: close\r\n"));
    }

    #[test]
    fn location_only_head() {
        let head = ResponseHead::location_only(HeaderValue::from_static("/there"));
        assert_eq!(
            head.encode(Version::HTTP_10, true),
            b"HTTP/1.0 302 Found\r\nLocation: /there\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn error_carries_extra_headers() {
        let err = LbErr::from(StatusCode::RANGE_NOT_SATISFIABLE)
            .with_header("Content-Range", "bytes */10");
        let bytes = error_response(&err, Version::HTTP_11, true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Range: bytes */10\r\n"));
        assert!(text.ends_with("</html>\n"));

        let no_body = error_response(&err, Version::HTTP_11, false);
        assert!(no_body.ends_with(b"\r\n\r\n"));
    }
}
