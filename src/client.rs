/*!
The client side of the connection: where responses go, who is on the other
end, and how writes are bounded in time.
*/
use std::{io, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt, DuplexStream, Stdout, WriteHalf},
    net::{tcp::OwnedWriteHalf, TcpStream},
    time::timeout,
};

/**
The writable half of a client connection.

When the connection is a real TCP socket, `socket()` exposes it so file
bodies can be handed to the kernel with `sendfile`; every other sink gets the
plain read/write path.
*/
pub trait ClientSink: AsyncWrite + Unpin {
    fn socket(&self) -> Option<&TcpStream> {
        None
    }
}

impl ClientSink for TcpStream {
    fn socket(&self) -> Option<&TcpStream> {
        Some(self)
    }
}

impl ClientSink for OwnedWriteHalf {
    fn socket(&self) -> Option<&TcpStream> {
        Some(self.as_ref())
    }
}

impl ClientSink for Stdout {}
impl ClientSink for DuplexStream {}
impl ClientSink for Vec<u8> {}
impl<T: AsyncWrite> ClientSink for WriteHalf<T> {}

impl<T: ClientSink + ?Sized> ClientSink for &mut T {
    fn socket(&self) -> Option<&TcpStream> {
        (**self).socket()
    }
}

/// Write all of `buf`, failing with `TimedOut` if it takes longer than `limit`.
pub async fn write_all_timed<W>(out: &mut W, buf: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(limit, out.write_all(buf)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "client write timed out",
        )),
    }
}

pub async fn flush_timed<W>(out: &mut W, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(limit, out.flush()).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "client flush timed out",
        )),
    }
}

/// True for errors meaning the client has gone away.
pub fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WriteZero
    )
}

/**
Identity of both ends of the connection, as reported by the supervisor that
accepted it.

The supervisor names a protocol prefix in `PROTO` (usually `TCP` or `TCP6`)
and sets `${PROTO}REMOTEIP` and friends.
*/
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Peer {
    pub remote_ip: Option<String>,
    pub remote_port: Option<String>,
    pub remote_ident: Option<String>,
    pub local_ip: Option<String>,
    pub local_port: Option<String>,
}

impl Peer {
    pub fn from_env() -> Peer {
        Peer::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Peer
    where
        F: Fn(&str) -> Option<String>,
    {
        let proto = match lookup("PROTO") {
            Some(p) => p,
            None => return Peer::default(),
        };
        let get = |suffix: &str| {
            lookup(&format!("{}{}", &proto, suffix)).filter(|v| !v.is_empty())
        };

        Peer {
            remote_ip: get("REMOTEIP"),
            remote_port: get("REMOTEPORT"),
            remote_ident: get("REMOTEINFO"),
            local_ip: get("LOCALIP"),
            local_port: get("LOCALPORT"),
        }
    }

    /// Fill in whatever the environment left out from the socket itself.
    pub fn fill_from_socket(&mut self, sock: &TcpStream) {
        if let Ok(addr) = sock.peer_addr() {
            self.remote_ip.get_or_insert_with(|| addr.ip().to_string());
            self.remote_port
                .get_or_insert_with(|| addr.port().to_string());
        }
        if let Ok(addr) = sock.local_addr() {
            self.local_ip.get_or_insert_with(|| addr.ip().to_string());
            self.local_port.get_or_insert_with(|| addr.port().to_string());
        }
    }
}

/// Whether file descriptor 0 is a socket.
pub fn stdin_is_socket() -> bool {
    // SAFETY: fstat only writes into the zeroed struct we hand it.
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(0, &mut st) != 0 {
            return false;
        }
        (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    }
}

/**
Take ownership of a socket on file descriptor 0.

Must be called from inside the runtime, and at most once.
*/
pub fn adopt_stdin_socket() -> io::Result<TcpStream> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: the caller has checked fd 0 is a socket, and nothing else in
    // the process owns it.
    let std_sock = unsafe { std::net::TcpStream::from_raw_fd(0) };
    std_sock.set_nonblocking(true)?;
    TcpStream::from_std(std_sock)
}
