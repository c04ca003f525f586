/*!
Virtual hosts: working out which host a request is for, and which directory
serves it.
*/
use std::{
    ffi::OsStr,
    io::ErrorKind,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use http::StatusCode;

use crate::{cfg::Cfg, client::Peer, request::Request, LbErr};

const DEFAULT_HOST_DIR: &str = "default";
const DEFAULT_PORT: &str = "80";
const DEFAULT_IP: &str = "127.0.0.1";

/// The directory serving one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostDir {
    /// Host name as the request named it, normalized.
    pub name: String,
    pub root: PathBuf,
}

impl HostDir {
    /// The filesystem location of a demangled request path.
    pub fn local_path(&self, path: &[u8]) -> PathBuf {
        let rel = match path.iter().position(|&b| b != b'/') {
            Some(n) => &path[n..],
            None => &[],
        };
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(OsStr::from_bytes(rel))
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HostChoice {
    Dir(HostDir),
    /// The host is a dangling symlink and redirects are on; the value is
    /// the `Location`.
    Redirect(Vec<u8>),
}

/**
Normalize the host a request is addressed to.

Without a `Host:` header the local address stands in. The port is stripped,
or appended when `port_append` is set. Names that could climb out of the
document root are rejected.
*/
pub fn server_name(cfg: &Cfg, req: &Request, peer: &Peer) -> Result<String, LbErr> {
    let port = peer.local_port.as_deref().unwrap_or(DEFAULT_PORT);

    let mut name = match req.host.as_deref().map(str::trim) {
        None | Some("") => {
            let ip = peer.local_ip.as_deref().unwrap_or(DEFAULT_IP);
            if cfg.port_append {
                format!("{}:{}", ip, port)
            } else {
                ip.to_string()
            }
        }
        Some(h) => {
            let port_at = if h.starts_with('[') {
                h.find(']').and_then(|n| h[n..].find(':').map(|m| n + m))
            } else {
                h.find(':')
            };
            match (port_at, cfg.port_append) {
                (None, true) => format!("{}:{}", h, port),
                (Some(n), false) => h[..n].to_string(),
                _ => h.to_string(),
            }
        }
    };
    name.make_ascii_lowercase();

    if name.contains('/') || name.starts_with('.') {
        return Err(LbErr::from(StatusCode::BAD_REQUEST)
            .wrap(format!("Bad Host header {:?}", &name)));
    }
    Ok(name)
}

/// Build the `Location` for a host directory that is a dangling symlink.
fn host_redirect(link: &Path, path: &[u8]) -> Vec<u8> {
    let link = link.as_os_str().as_bytes();
    match link.strip_prefix(b"=") {
        Some(verbatim) => verbatim.to_vec(),
        None => {
            let mut loc = link.to_vec();
            let rel = match path.iter().position(|&b| b != b'/') {
                Some(n) => &path[n..],
                None => &[],
            };
            loc.extend_from_slice(rel);
            loc
        }
    }
}

async fn is_dir(p: &Path) -> bool {
    match tokio::fs::metadata(p).await {
        Ok(md) => md.is_dir(),
        Err(_) => false,
    }
}

/// Pick the directory that serves host `name`.
pub async fn select_dir(cfg: &Cfg, name: &str, path: &[u8]) -> Result<HostChoice, LbErr> {
    log::trace!("select_dir( {:?}, {:?} ) called.", name, String::from_utf8_lossy(path));

    if !cfg.virtual_hosts {
        return Ok(HostChoice::Dir(HostDir {
            name: name.to_string(),
            root: cfg.root.clone(),
        }));
    }

    let candidate = cfg.root.join(name);
    if !name.is_empty() && is_dir(&candidate).await {
        return Ok(HostChoice::Dir(HostDir {
            name: name.to_string(),
            root: candidate,
        }));
    }

    if cfg.redirect && !name.is_empty() {
        match tokio::fs::read_link(&candidate).await {
            Ok(link) => {
                log::debug!("host {:?} redirects via {}", name, link.display());
                return Ok(HostChoice::Redirect(host_redirect(&link, path)));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::debug!("read_link({}): {}", candidate.display(), &e),
        }
    }

    let default = cfg.root.join(DEFAULT_HOST_DIR);
    if is_dir(&default).await {
        return Ok(HostChoice::Dir(HostDir {
            name: name.to_string(),
            root: default,
        }));
    }

    Err(LbErr::from(StatusCode::NOT_FOUND).wrap(format!(
        "This host is not served here: {:?}",
        name
    )))
}
