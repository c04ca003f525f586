pub mod cfg;
pub mod cgi;
pub mod client;
pub mod conn;
pub mod date;
pub mod dirlist;
pub mod header;
pub mod host;
pub mod mime;
pub mod reap;
pub mod request;
pub mod resolve;
pub mod resp;
pub mod rlog;
pub mod serve;

use std::borrow::Cow;

use http::{header::HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use tokio::io::AsyncBufRead;

use crate::{
    cfg::Cfg,
    client::{ClientSink, Peer},
    conn::Connection,
    header::ScanError,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub static SERVER: Lazy<String> = Lazy::new(|| format!("Lugburz v{}", VERSION));

pub type HeaderPair = (Cow<'static, str>, HeaderValue);

#[derive(Debug)]
pub struct LbErr {
    code: StatusCode,
    headers: Vec<HeaderPair>,
    messages: Vec<String>,
    hangup: bool,
}

impl LbErr {
    pub fn new<S: Into<String>>(message: S) -> LbErr {
        LbErr {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            headers: vec![],
            messages: vec![message.into()],
            hangup: false,
        }
    }

    /// The client went away; nothing should be written back.
    pub fn hangup<S: Into<String>>(message: S) -> LbErr {
        LbErr {
            hangup: true,
            ..LbErr::new(message)
        }
    }

    pub fn with_code<C: Into<StatusCode>>(self, code: C) -> LbErr {
        LbErr {
            code: code.into(),
            ..self
        }
    }

    pub fn with_header<V>(self, name: &'static str, v: V) -> LbErr
    where
        V: TryInto<HeaderValue>,
    {
        match v.try_into() {
            Ok(val) => {
                let mut headers = self.headers;
                headers.push((Cow::Borrowed(name), val));
                LbErr { headers, ..self }
            }
            Err(_) => self
                .with_code(StatusCode::INTERNAL_SERVER_ERROR)
                .wrap("Unable to add header value."),
        }
    }

    pub fn wrap<S: Into<String>>(self, s: S) -> LbErr {
        let mut messages = self.messages;
        messages.push(s.into());
        LbErr { messages, ..self }
    }

    pub fn code(&self) -> StatusCode { self.code }

    pub fn headers(&self) -> &[HeaderPair] { &self.headers }

    pub fn is_hangup(&self) -> bool { self.hangup }
}

impl From<String> for LbErr {
    fn from(s: String) -> LbErr { LbErr::new(s) }
}

impl From<&str> for LbErr {
    fn from(s: &str) -> LbErr { LbErr::new(String::from(s)) }
}

impl From<StatusCode> for LbErr {
    fn from(code: StatusCode) -> LbErr {
        LbErr {
            code,
            headers: vec![],
            messages: vec![],
            hangup: false,
        }
    }
}

impl From<ScanError> for LbErr {
    fn from(e: ScanError) -> LbErr {
        let code = match e {
            ScanError::Malformed => StatusCode::BAD_REQUEST,
            _ => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        };
        LbErr::from(code).wrap(e.to_string())
    }
}

impl std::fmt::Display for LbErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hangup {
            writeln!(f, "Client hung up")?;
        } else {
            writeln!(f, "Returning error {}", &self.code)?;
        }
        for (name, val) in self.headers.iter().rev() {
            writeln!(f, "    {}: {:?}", name, val)?;
        }
        for msg in self.messages.iter() {
            writeln!(f, "{}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for LbErr {}

/**
Serve every request a client sends over one connection, then return.

`input` and `output` are the two directions of the client connection; the
function returns once the client closes, a timeout expires, or a response
demands the connection be closed.
*/
pub async fn serve_connection<R, W>(
    cfg: &Cfg,
    peer: &Peer,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: ClientSink,
{
    Connection::new(cfg, peer, input, output).serve().await
}
