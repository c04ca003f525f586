/*!
The gateway: answering requests by running programs, CGI/1.1 style.

A session runs a program with the request described in its environment,
feeds it the request body, and relays what it writes back to the client.
Program output starts with a header block that is rewritten into a proper
response head, unless the program is NPH (its file name starts with
`nph-`) or a CONNECT handler, in which case every byte is passed through
untouched.

All of it happens in one `select!` loop over the program's stdout, one step
of body feeding, and an inactivity watchdog.
*/
use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Stdio,
};

use http::{header::HeaderValue, Method, StatusCode};
use tokio::{
    io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, ChildStdout, Command},
    time::{sleep, Instant},
};

use crate::{
    cfg::Cfg,
    client::{flush_timed, write_all_timed, ClientSink, Peer},
    header::{env_name, find_block_end, Field, HeaderScanner},
    host::HostDir,
    reap::Reaper,
    request::Request,
    resolve::CgiTarget,
    resp::{version_str, ResponseHead},
    LbErr, SERVER,
};

const READ_BUF_SIZE: usize = 8192;
const FEED_BUF_SIZE: usize = 8192;

/// Variables the server sets itself; never inherited from its own environment.
static RESERVED: &[&str] = &[
    "AUTH_TYPE",
    "CONTENT_LENGTH",
    "CONTENT_TYPE",
    "GATEWAY_INTERFACE",
    "PATH_INFO",
    "PATH_TRANSLATED",
    "QUERY_STRING",
    "REMOTE_ADDR",
    "REMOTE_IDENT",
    "REMOTE_PORT",
    "REQUEST_METHOD",
    "REQUEST_URI",
    "SCRIPT_NAME",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_PROTOCOL",
    "SERVER_SOFTWARE",
];

/// Request headers never exported as `HTTP_*` variables.
static UNEXPORTED: &[&str] = &["content-length", "content-type", "proxy"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Output starts with a CGI header block.
    Parsed,
    /// Output is a complete HTTP response.
    Nph,
    /// CONNECT: output is passed through, and the client stream is fed to
    /// the program until the client closes it.
    Tunnel,
}

/// A program to run and how to treat it.
#[derive(Debug)]
pub struct Job {
    pub program: PathBuf,
    pub script_name: Vec<u8>,
    pub path_info: Option<Vec<u8>>,
    pub mode: Mode,
}

impl From<CgiTarget> for Job {
    fn from(t: CgiTarget) -> Job {
        let mode = if t.nph { Mode::Nph } else { Mode::Parsed };
        Job {
            program: t.program,
            script_name: t.script_name,
            path_info: t.path_info,
            mode,
        }
    }
}

impl Job {
    /// The configured CONNECT handler; relative paths are found under the host directory.
    pub fn tunnel(cfg: &Cfg, host: &HostDir) -> Result<Job, LbErr> {
        let handler = cfg.connect_handler.as_ref().ok_or_else(|| {
            LbErr::from(StatusCode::METHOD_NOT_ALLOWED).wrap("No CONNECT handler configured.")
        })?;
        let program = if handler.is_absolute() {
            handler.clone()
        } else {
            host.root.join(handler)
        };
        let script_name = program
            .file_name()
            .map(|f| f.as_bytes().to_vec())
            .unwrap_or_default();
        Ok(Job {
            program,
            script_name,
            path_info: None,
            mode: Mode::Tunnel,
        })
    }
}

/// Everything about the request a session needs.
pub struct Context<'a> {
    pub cfg: &'a Cfg,
    pub host: &'a HostDir,
    pub req: &'a Request,
    pub peer: &'a Peer,
}

/// How a session that got as far as sending something ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub status: u16,
    pub bytes: u64,
}

fn is_inherited(name: &OsStr) -> bool {
    let name = name.as_bytes();
    if name.starts_with(b"HTTP_") {
        return false;
    }
    !RESERVED.iter().any(|r| r.as_bytes() == name)
}

/**
The program's environment: `inherited` filtered of anything the server sets
itself, then the CGI/1.1 variables, then one `HTTP_*` variable per request
header.
*/
pub fn environment<I>(ctx: &Context<'_>, job: &Job, inherited: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let req = ctx.req;
    let mut env: Vec<(OsString, OsString)> = inherited
        .into_iter()
        .filter(|(k, _)| is_inherited(k))
        .collect();

    let mut set = |k: &str, v: &[u8]| {
        env.push((OsString::from(k), OsStr::from_bytes(v).to_os_string()));
    };

    set("GATEWAY_INTERFACE", b"CGI/1.1");
    set("SERVER_PROTOCOL", version_str(req.version).as_bytes());
    set("SERVER_SOFTWARE", SERVER.as_bytes());
    set("SERVER_NAME", ctx.host.name.as_bytes());
    set(
        "SERVER_PORT",
        ctx.peer.local_port.as_deref().unwrap_or("80").as_bytes(),
    );
    set("REQUEST_METHOD", req.method.as_str().as_bytes());
    set("REQUEST_URI", &req.path);
    set("SCRIPT_NAME", &job.script_name);
    if let Some(ip) = ctx.peer.remote_ip.as_deref() {
        set("REMOTE_ADDR", ip.as_bytes());
    }
    if let Some(port) = ctx.peer.remote_port.as_deref() {
        set("REMOTE_PORT", port.as_bytes());
    }
    if let Some(ident) = ctx.peer.remote_ident.as_deref() {
        set("REMOTE_IDENT", ident.as_bytes());
    }
    if let Some(auth) = req.headers.get("authorization") {
        if let Some(scheme) = auth.as_bytes().split(|b| b.is_ascii_whitespace()).next() {
            set("AUTH_TYPE", scheme);
        }
    }
    if req.content_length > 0 || req.content_type.is_some() {
        if let Some(ct) = req.content_type.as_deref() {
            set("CONTENT_TYPE", ct.as_bytes());
        }
        set("CONTENT_LENGTH", req.content_length.to_string().as_bytes());
    }
    if let Some(q) = req.query.as_deref() {
        set("QUERY_STRING", q.as_bytes());
    }
    if let Some(info) = job.path_info.as_deref() {
        set("PATH_INFO", info);
        let local = ctx.host.local_path(info);
        let translated = local.canonicalize().unwrap_or(local);
        set("PATH_TRANSLATED", translated.as_os_str().as_bytes());
    }

    for (name, val) in req.headers.iter() {
        if UNEXPORTED.contains(&name.as_str()) {
            continue;
        }
        let key = format!("HTTP_{}", env_name(name.as_str()));
        set(&key, val.as_bytes());
    }

    env
}

/// A query string without `=` is split on `+` into arguments.
pub fn isindex_args(query: Option<&str>) -> Vec<&str> {
    match query {
        Some(q) if !q.is_empty() && !q.contains('=') => q.split('+').collect(),
        _ => Vec::new(),
    }
}

fn command(ctx: &Context<'_>, job: &Job) -> Command {
    let mut cmd = Command::new(&job.program);
    if let Some(dir) = job.program.parent() {
        cmd.current_dir(dir);
    }
    cmd.args(isindex_args(ctx.req.query.as_deref()));
    cmd.env_clear();
    cmd.envs(environment(ctx, job, std::env::vars_os()));
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd
}

fn spawn_error(e: io::Error, program: &Path) -> LbErr {
    let code = match e.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::ENOEXEC) | Some(libc::ENOTDIR) => {
            StatusCode::BAD_GATEWAY
        }
        _ => match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    LbErr::from(code).wrap(format!("Unable to run {}: {}", program.display(), &e))
}

fn bad_gateway<S: Into<String>>(msg: S) -> LbErr {
    LbErr::from(StatusCode::BAD_GATEWAY).wrap(msg)
}

/// A `Status:` value: a code of at least 100, then an optional reason.
pub fn parse_status(v: &[u8]) -> Option<(StatusCode, Option<String>)> {
    let s = std::str::from_utf8(v).ok()?.trim();
    let (code, reason) = match s.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (s, ""),
    };
    let n: u16 = code.parse().ok()?;
    if n < 100 {
        return None;
    }
    let code = StatusCode::from_u16(n).ok()?;
    let reason = if reason.is_empty() {
        None
    } else {
        Some(reason.to_string())
    };
    Some((code, reason))
}

/// The status code in an `HTTP/1.x NNN ...` line, for the log.
fn nph_status(buf: &[u8]) -> u16 {
    let after = match buf.iter().position(|&b| b == b' ') {
        Some(n) => &buf[n + 1..],
        None => return 0,
    };
    after
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .take(3)
        .fold(0u16, |acc, &b| acc * 10 + u16::from(b - b'0'))
}

/// The first complete `Location` line in a header block still arriving.
fn location_line(hbuf: &[u8]) -> Option<Field> {
    let complete = match hbuf.iter().rposition(|&b| b == b'\n') {
        Some(n) => &hbuf[..=n],
        None => return None,
    };
    complete.split_inclusive(|&b| b == b'\n').find_map(|line| {
        let colon = line.iter().position(|&b| b == b':')?;
        let name = std::str::from_utf8(&line[..colon]).ok()?.trim();
        if !name.eq_ignore_ascii_case("location") {
            return None;
        }
        let value = std::str::from_utf8(&line[colon + 1..]).ok()?.trim();
        Some(Field {
            name: name.to_string(),
            value: value.as_bytes().to_vec(),
        })
    })
}

/**
Turn a program's header block into a response head.

`Location` wins outright. `Status` picks the code; without it the answer is
200 with a `Pragma: no-cache`. The program's other fields are relayed as
they came.
*/
pub fn head_from_fields(fields: Vec<Field>) -> Result<ResponseHead, LbErr> {
    if let Some(loc) = fields.iter().find(|f| f.is("location")) {
        let loc = HeaderValue::from_bytes(&loc.value)
            .map_err(|_| bad_gateway("Invalid Location from program."))?;
        return Ok(ResponseHead::location_only(loc));
    }

    let mut head = match fields.iter().find(|f| f.is("status")) {
        Some(f) => match parse_status(&f.value) {
            Some((code, Some(reason))) => ResponseHead::new(code).with_reason(reason),
            Some((code, None)) => ResponseHead::new(code),
            None => {
                return Err(LbErr::new(format!(
                    "Program sent invalid Status {:?}",
                    f.value_str()
                )));
            }
        },
        None => ResponseHead::new(StatusCode::OK).header("Pragma", "no-cache"),
    };

    for f in fields.into_iter() {
        if f.is("status") || f.is("connection") || f.is("server") {
            continue;
        }
        let val = HeaderValue::from_bytes(&f.value)
            .map_err(|_| bad_gateway(format!("Invalid value for {:?} from program.", &f.name)))?;
        head.push(Cow::Owned(f.name), val);
    }
    Ok(head)
}

/// Moves the request body from the client to the program, a piece at a time.
struct BodyFeeder {
    stdin: Option<ChildStdin>,
    /// Bytes left to read from the client; `None` reads until it closes.
    remaining: Option<u64>,
    pending: Vec<u8>,
    pos: usize,
}

impl BodyFeeder {
    fn new(stdin: Option<ChildStdin>, remaining: Option<u64>) -> BodyFeeder {
        let stdin = match remaining {
            Some(0) => None,
            _ => stdin,
        };
        BodyFeeder {
            stdin,
            remaining,
            pending: Vec::with_capacity(FEED_BUF_SIZE),
            pos: 0,
        }
    }

    fn done(&self) -> bool {
        self.stdin.is_none()
    }

    fn close(&mut self) {
        self.stdin = None;
        self.pending.clear();
        self.pos = 0;
    }

    /**
    Either write some pending bytes to the program or read more from the
    client. Returns whether anything moved.

    Both halves are cancel-safe: a step interrupted by another branch of
    the session loop loses nothing.
    */
    async fn step<R>(&mut self, input: &mut R) -> Result<bool, LbErr>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.pos < self.pending.len() {
            let res = match self.stdin.as_mut() {
                Some(stdin) => stdin.write(&self.pending[self.pos..]).await,
                None => return Ok(false),
            };
            match res {
                Ok(0) => self.close(),
                Ok(n) => {
                    self.pos += n;
                    if self.pos == self.pending.len() {
                        self.pending.clear();
                        self.pos = 0;
                        if self.remaining == Some(0) {
                            self.close();
                        }
                    }
                }
                Err(e) => {
                    log::debug!("program stopped reading its input: {}", &e);
                    self.close();
                }
            }
            return Ok(true);
        }

        let want = match self.remaining {
            Some(0) => {
                self.close();
                return Ok(false);
            }
            Some(n) => n.min(FEED_BUF_SIZE as u64),
            None => FEED_BUF_SIZE as u64,
        };
        let n = (&mut *input)
            .take(want)
            .read_buf(&mut self.pending)
            .await
            .map_err(|e| LbErr::hangup(format!("Error reading request body: {}", &e)))?;

        if n == 0 {
            if self.remaining.is_none() {
                self.close();
                return Ok(false);
            }
            return Err(LbErr::hangup("Client closed connection inside request body."));
        }
        if let Some(r) = self.remaining.as_mut() {
            *r -= n as u64;
        }
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Headers,
    Body,
    Done,
}

struct Session<'c> {
    ctx: &'c Context<'c>,
    mode: Mode,
    state: State,
    hbuf: Vec<u8>,
    status: u16,
    bytes: u64,
    head_sent: bool,
}

impl<'c> Session<'c> {
    fn new(ctx: &'c Context<'c>, mode: Mode) -> Session<'c> {
        Session {
            ctx,
            mode,
            state: State::Headers,
            hbuf: Vec::new(),
            status: 0,
            bytes: 0,
            head_sent: false,
        }
    }

    async fn send<W>(&mut self, out: &mut W, data: &[u8]) -> Result<(), LbErr>
    where
        W: ClientSink + ?Sized,
    {
        write_all_timed(out, data, self.ctx.cfg.write_timeout)
            .await
            .map_err(|e| LbErr::hangup(format!("Error writing to client: {}", &e)))
    }

    async fn on_output<W>(&mut self, chunk: &[u8], out: &mut W) -> Result<(), LbErr>
    where
        W: ClientSink + ?Sized,
    {
        match (self.state, self.mode) {
            (State::Done, _) => Ok(()),
            (State::Body, _) => {
                self.send(out, chunk).await?;
                self.bytes += chunk.len() as u64;
                Ok(())
            }
            (State::Headers, Mode::Nph) | (State::Headers, Mode::Tunnel) => {
                self.hbuf.extend_from_slice(chunk);
                if self.hbuf.contains(&b'\n') || self.hbuf.len() > self.ctx.cfg.max_cgi_header {
                    self.release_raw_head(out).await?;
                }
                Ok(())
            }
            (State::Headers, Mode::Parsed) => self.on_header_bytes(chunk, out).await,
        }
    }

    /// Relay the start of a raw response once its status line is whole,
    /// noting the status for the log.
    async fn release_raw_head<W>(&mut self, out: &mut W) -> Result<(), LbErr>
    where
        W: ClientSink + ?Sized,
    {
        let first = std::mem::take(&mut self.hbuf);
        self.status = nph_status(&first);
        self.state = State::Body;
        self.head_sent = true;
        self.send(out, &first).await?;
        self.bytes += first.len() as u64;
        Ok(())
    }

    async fn on_header_bytes<W>(&mut self, chunk: &[u8], out: &mut W) -> Result<(), LbErr>
    where
        W: ClientSink + ?Sized,
    {
        let cfg = self.ctx.cfg;
        self.hbuf.extend_from_slice(chunk);
        let end = find_block_end(&self.hbuf);
        let fields = match end {
            Some(end) => HeaderScanner::new(cfg.cgi_header_limits())
                .scan_block(&self.hbuf[..end])
                .map_err(|e| bad_gateway(format!("Bad header block from program: {}", &e)))?,
            // A redirect goes out as soon as its line is complete.
            None => match location_line(&self.hbuf) {
                Some(field) => vec![field],
                None if self.hbuf.len() > cfg.max_cgi_header => {
                    return Err(bad_gateway("Program header block too large."));
                }
                None => return Ok(()),
            },
        };
        let head = head_from_fields(fields)?;

        self.status = head.code().as_u16();
        self.head_sent = true;
        self.send(out, &head.encode(self.ctx.req.version, false)).await?;

        if head.get("location").is_some() && head.headers().len() == 1 {
            self.state = State::Done;
            self.hbuf = Vec::new();
            return Ok(());
        }

        self.state = State::Body;
        let rest = match end {
            Some(end) => self.hbuf.split_off(end),
            None => Vec::new(),
        };
        self.hbuf = Vec::new();
        if !rest.is_empty() {
            self.send(out, &rest).await?;
            self.bytes += rest.len() as u64;
        }
        Ok(())
    }

    fn on_eof(&self) -> Result<(), LbErr> {
        match (self.state, self.mode) {
            (State::Headers, Mode::Parsed) if self.hbuf.is_empty() => {
                Err(bad_gateway("Program produced no output."))
            }
            (State::Headers, Mode::Parsed) => {
                Err(bad_gateway("Program output ended inside its header block."))
            }
            (State::Headers, _) => Err(bad_gateway("Program produced no output.")),
            _ => Ok(()),
        }
    }

    /// Run until the program's output ends, the session is cut short, or
    /// something fails.
    async fn pump<R, W>(
        &mut self,
        mut stdout: ChildStdout,
        feeder: &mut BodyFeeder,
        input: &mut R,
        out: &mut W,
    ) -> Result<(), LbErr>
    where
        R: AsyncBufRead + Unpin,
        W: ClientSink + ?Sized,
    {
        let limit = self.ctx.cfg.cgi_timeout;
        let watchdog = sleep(limit);
        tokio::pin!(watchdog);
        let mut obuf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                res = stdout.read(&mut obuf) => {
                    let n = res.map_err(|e| {
                        bad_gateway(format!("Error reading program output: {}", &e))
                    })?;
                    watchdog.as_mut().reset(Instant::now() + limit);
                    if n == 0 {
                        if self.state == State::Headers
                            && self.mode != Mode::Parsed
                            && !self.hbuf.is_empty()
                        {
                            self.release_raw_head(out).await?;
                        }
                        return self.on_eof();
                    }
                    self.on_output(&obuf[..n], out).await?;
                    if self.state == State::Done {
                        return Ok(());
                    }
                }
                res = feeder.step(input), if !feeder.done() => {
                    if res? {
                        watchdog.as_mut().reset(Instant::now() + limit);
                    }
                }
                () = watchdog.as_mut() => {
                    return Err(LbErr::from(StatusCode::GATEWAY_TIMEOUT).wrap(format!(
                        "Program idle for more than {:?}.", limit
                    )));
                }
            }
        }
    }
}

/**
Run `job` to answer the request in `ctx`.

Failures before anything reached the client come back as `Err`, for the
caller to turn into an error response. Once a head has gone out, failures
only cut the response short, and the `Outcome` says what was sent. The
connection must be closed afterward either way.
*/
pub async fn run<R, W>(
    ctx: &Context<'_>,
    job: &Job,
    input: &mut R,
    out: &mut W,
    reaper: &mut Reaper,
) -> Result<Outcome, LbErr>
where
    R: AsyncBufRead + Unpin,
    W: ClientSink + ?Sized,
{
    log::trace!(
        "cgi::run( {}, {:?} ) called.",
        job.program.display(),
        job.mode
    );

    if ctx.req.method == Method::HEAD {
        return Err(LbErr::from(StatusCode::METHOD_NOT_ALLOWED)
            .with_header("Allow", "GET, POST")
            .wrap("HEAD request for a program."));
    }

    let mut child = command(ctx, job)
        .spawn()
        .map_err(|e| spawn_error(e, &job.program))?;
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            if let Err(e) = child.start_kill() {
                log::debug!("Error killing child: {}", &e);
            }
            reaper.adopt(child);
            return Err(LbErr::new("Program started without an output pipe."));
        }
    };
    let remaining = match job.mode {
        Mode::Tunnel => None,
        _ => Some(ctx.req.content_length),
    };
    let mut feeder = BodyFeeder::new(child.stdin.take(), remaining);

    let mut session = Session::new(ctx, job.mode);
    let mut res = session.pump(stdout, &mut feeder, input, out).await;
    drop(feeder);
    if res.is_ok() && session.head_sent {
        if let Err(e) = flush_timed(out, ctx.cfg.write_timeout).await {
            res = Err(LbErr::hangup(format!("Error flushing to client: {}", &e)));
        }
    }

    let outcome = Outcome {
        status: session.status,
        bytes: session.bytes,
    };
    match res {
        Ok(()) => {
            reaper.adopt(child);
            Ok(outcome)
        }
        Err(e) => {
            if let Err(ke) = child.start_kill() {
                log::debug!("Error killing child: {}", &ke);
            }
            reaper.adopt(child);
            if session.head_sent {
                log::warn!("Response from {} cut short:\n{}", job.program.display(), &e);
                Ok(outcome)
            } else {
                Err(e)
            }
        }
    }
}
