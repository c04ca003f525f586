/*!
Static files: deciding what part of a file to send and with what head, and
then sending it.

Bodies go out through `sendfile(2)` when the client is a TCP socket, in
chunks small enough that a client reading at `min_send_rate` finishes each
one inside `write_timeout`. Anything else (or a kernel that refuses) gets an
ordinary read/write loop under the same per-chunk deadline.
*/
use std::{
    io::{self, SeekFrom, Write},
    os::unix::{fs::MetadataExt, io::AsRawFd},
    path::PathBuf,
    time::Duration,
};

use http::{header::HeaderValue, Method, StatusCode};
use smallvec::SmallVec;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, Interest},
    net::TcpStream,
    time::timeout,
};

use crate::{
    cfg::Cfg,
    client::{flush_timed, write_all_timed, ClientSink},
    date::format_http_date,
    request::{RangeSpec, Request},
    resolve::StaticFile,
    resp::ResponseHead,
    LbErr,
};

/// Below this many bytes the copy path wins.
const SENDFILE_MIN: u64 = 4096;
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Everything needed to answer with one static file.
#[derive(Debug)]
pub struct FilePlan {
    pub head: ResponseHead,
    pub path: PathBuf,
    pub start: u64,
    pub len: u64,
    pub send_body: bool,
}

/// The half-open byte interval `[start, end)` of a file of `size` bytes
/// to serve, or `None` if the range can't be satisfied.
pub fn effective_range(range: Option<RangeSpec>, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return Some((0, 0));
    }
    match range {
        None => Some((0, size)),
        Some(RangeSpec::From { start, end }) => {
            let end = match end {
                Some(e) => e.saturating_add(1).min(size),
                None => size,
            };
            if start >= end {
                None
            } else {
                Some((start, end))
            }
        }
        Some(RangeSpec::Suffix(0)) => None,
        Some(RangeSpec::Suffix(n)) => Some((size.saturating_sub(n), size)),
    }
}

fn content_range(start: u64, end: u64, size: u64) -> Result<HeaderValue, LbErr> {
    let mut buff: SmallVec<[u8; 64]> = SmallVec::new();
    write!(&mut buff, "bytes {}-{}/{}", start, end - 1, size)
        .map_err(|e| LbErr::new(format!("Error formatting Content-Range: {}", &e)))?;
    HeaderValue::from_bytes(&buff)
        .map_err(|e| LbErr::new(format!("Invalid Content-Range value: {}", &e)))
}

/**
Work out the response to a request for `file`.

POST is refused. A file not modified since `If-Modified-Since` gets a 304.
Otherwise the head carries the served length, and is a 206 with
`Content-Range` when only part of the file goes out.
*/
pub fn plan_file(req: &Request, file: StaticFile) -> Result<FilePlan, LbErr> {
    log::trace!("plan_file( {:?}, {} ) called.", &req.path_lossy(), file.path.display());

    if req.method == Method::POST {
        return Err(LbErr::from(StatusCode::METHOD_NOT_ALLOWED)
            .with_header("Allow", "GET, HEAD")
            .wrap("POST to a static resource."));
    }

    let mtime = file.meta.mtime();
    let last_modified = format_http_date(mtime);

    if req.if_modified_since != 0 && mtime <= req.if_modified_since {
        let head = ResponseHead::new(StatusCode::NOT_MODIFIED)
            .header("Last-Modified", last_modified);
        return Ok(FilePlan {
            head,
            path: file.path,
            start: 0,
            len: 0,
            send_body: false,
        });
    }

    let size = file.meta.len();
    let (start, end) = match effective_range(req.range, size) {
        Some(r) => r,
        None => {
            return Err(LbErr::from(StatusCode::RANGE_NOT_SATISFIABLE)
                .with_header("Content-Range", format!("bytes */{}", size))
                .wrap(format!("Range {:?} of {} byte file", &req.range, size)));
        }
    };
    let len = end - start;
    let partial = start > 0 || end < size;

    let code = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut head = ResponseHead::new(code)
        .header("Content-Type", file.mime.as_str())
        .header("Content-Length", len)
        .header("Last-Modified", last_modified)
        .header("Accept-Ranges", "bytes");
    if let Some(enc) = file.encoding {
        head = head.header("Content-Encoding", enc);
    }
    if partial {
        head.push("Content-Range".into(), content_range(start, end, size)?);
    }

    Ok(FilePlan {
        head,
        path: file.path,
        start,
        len,
        send_body: !req.is_head(),
    })
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "file transfer chunk timed out")
}

/// One `sendfile` call's worth of progress, waiting for writability first.
async fn sendfile_once(
    sock: &TcpStream,
    fd: i32,
    offset: &mut libc::off_t,
    count: usize,
) -> io::Result<usize> {
    loop {
        sock.writable().await?;
        let res = sock.try_io(Interest::WRITABLE, || {
            // SAFETY: both descriptors stay open for the duration of the
            // call, and `offset` is a valid, exclusively borrowed off_t.
            let n = unsafe { libc::sendfile(sock.as_raw_fd(), fd, &mut *offset, count) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        match res {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            x => return x,
        }
    }
}

/// Send `count` bytes, all within `limit`.
async fn sendfile_chunk(
    sock: &TcpStream,
    fd: i32,
    offset: &mut libc::off_t,
    count: usize,
    limit: Duration,
) -> io::Result<usize> {
    let transfer = async {
        let mut done = 0usize;
        while done < count {
            match sendfile_once(sock, fd, offset, count - done).await? {
                0 => break,
                n => done += n,
            }
        }
        Ok::<usize, io::Error>(done)
    };
    match timeout(limit, transfer).await {
        Ok(res) => res,
        Err(_) => Err(timed_out()),
    }
}

/// Returns `Ok(None)` if the kernel won't `sendfile` this pair at all.
async fn send_zero_copy(
    sock: &TcpStream,
    file: &File,
    start: u64,
    len: u64,
    cfg: &Cfg,
) -> io::Result<Option<u64>> {
    let fd = file.as_raw_fd();
    let mut offset = libc::off_t::try_from(start)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
    let chunk_max = cfg.send_chunk();
    let mut sent: u64 = 0;

    while sent < len {
        let count = (len - sent).min(chunk_max) as usize;
        match sendfile_chunk(sock, fd, &mut offset, count, cfg.write_timeout).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank during transfer",
                ));
            }
            Ok(n) => sent += n as u64,
            Err(e)
                if sent == 0
                    && matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS)) =>
            {
                log::debug!("sendfile unavailable ({}); copying instead", &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(sent))
}

async fn send_copy<W>(
    out: &mut W,
    file: &mut File,
    start: u64,
    len: u64,
    cfg: &Cfg,
) -> io::Result<u64>
where
    W: ClientSink + ?Sized,
{
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; COPY_BUF_SIZE.min(len.max(1) as usize)];
    let mut sent: u64 = 0;

    while sent < len {
        let want = (len - sent).min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank during transfer",
            ));
        }
        write_all_timed(out, &buf[..n], cfg.write_timeout).await?;
        sent += n as u64;
    }
    flush_timed(out, cfg.write_timeout).await?;
    Ok(sent)
}

/**
Send the body bytes `plan` describes. The head must already be written.

Returns the number of bytes sent.
*/
pub async fn send_file<W>(out: &mut W, plan: &FilePlan, cfg: &Cfg) -> io::Result<u64>
where
    W: ClientSink + ?Sized,
{
    log::trace!(
        "send_file( {}, {}, {} ) called.",
        plan.path.display(),
        plan.start,
        plan.len
    );

    if plan.len == 0 {
        return Ok(0);
    }
    let mut file = File::open(&plan.path).await?;

    if plan.len >= SENDFILE_MIN {
        if let Some(sock) = out.socket() {
            if let Some(n) = send_zero_copy(sock, &file, plan.start, plan.len, cfg).await? {
                return Ok(n);
            }
        }
    }

    send_copy(out, &mut file, plan.start, plan.len, cfg).await
}
