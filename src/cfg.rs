use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{header::Limits, mime::MimeMap};

const READ_TIMEOUT_SECS: u64 = 20;
const WRITE_TIMEOUT_SECS: u64 = 20;
const CGI_TIMEOUT_SECS: u64 = 5 * 60;
const MIN_SEND_RATE: u64 = 4096;
const MAX_REQUEST_LINE: usize = 8192;
const MAX_CGI_HEADER: usize = 8192;
const MAX_POST_BODY: u64 = 1024 * 1024 * 1024;

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CfgFile {
    root: Option<PathBuf>,
    virtual_hosts: Option<bool>,
    cgi: Option<bool>,
    dirlist: Option<bool>,
    redirect: Option<bool>,
    port_append: Option<bool>,
    connect_handler: Option<PathBuf>,
    read_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    cgi_timeout_secs: Option<u64>,
    min_send_rate: Option<u64>,
    max_request_line: Option<usize>,
    max_header_line: Option<usize>,
    max_headers: Option<usize>,
    max_header_block: Option<usize>,
    max_cgi_header: Option<usize>,
    max_post_body: Option<u64>,
    mime: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug)]
pub struct Cfg {
    /// Document root. Each virtual host is a directory under it.
    pub root: PathBuf,
    pub virtual_hosts: bool,
    pub cgi: bool,
    pub dirlist: bool,
    pub redirect: bool,
    pub port_append: bool,
    pub connect_handler: Option<PathBuf>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub cgi_timeout: Duration,
    /// Floor on client throughput used to size file transfer chunks.
    pub min_send_rate: u64,
    pub max_request_line: usize,
    pub header_limits: Limits,
    pub max_cgi_header: usize,
    pub max_post_body: u64,
    pub mime: MimeMap,
}

impl Default for Cfg {
    fn default() -> Cfg {
        Cfg {
            root: PathBuf::from("."),
            virtual_hosts: true,
            cgi: false,
            dirlist: false,
            redirect: false,
            port_append: false,
            connect_handler: None,
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            cgi_timeout: Duration::from_secs(CGI_TIMEOUT_SECS),
            min_send_rate: MIN_SEND_RATE,
            max_request_line: MAX_REQUEST_LINE,
            header_limits: Limits::default(),
            max_cgi_header: MAX_CGI_HEADER,
            max_post_body: MAX_POST_BODY,
            mime: MimeMap::default(),
        }
    }
}

impl Cfg {
    pub fn load<P: AsRef<Path>>(p: P) -> Result<Cfg, String> {
        let p = p.as_ref();
        let bytes = std::fs::read(p).map_err(|e| format!(
            "Unable to read file {}: {}", p.display(), &e
        ))?;
        Cfg::from_toml(&bytes).map_err(|e| format!(
            "Error in config file {}: {}", p.display(), &e
        ))
    }

    pub fn from_toml(bytes: &[u8]) -> Result<Cfg, String> {
        let cfgf: CfgFile = toml::from_slice(bytes).map_err(|e| format!(
            "Unable to deserialize: {}", &e
        ))?;
        Cfg::from_file(cfgf)
    }

    fn from_file(cfgf: CfgFile) -> Result<Cfg, String> {
        let d = Cfg::default();

        let root = cfgf.root.unwrap_or(d.root);
        let root = root.canonicalize().map_err(|e| format!(
            "Unable to canonicalize root {}: {}", root.display(), &e
        ))?;

        let header_limits = Limits {
            max_line: cfgf.max_header_line.unwrap_or(d.header_limits.max_line),
            max_fields: cfgf.max_headers.unwrap_or(d.header_limits.max_fields),
            max_block: cfgf.max_header_block.unwrap_or(d.header_limits.max_block),
        };
        if header_limits.max_line == 0 || header_limits.max_fields == 0 {
            return Err("Header limits must be greater than zero.".to_string());
        }

        let min_send_rate = cfgf.min_send_rate.unwrap_or(d.min_send_rate);
        if min_send_rate == 0 {
            return Err("min_send_rate must be greater than zero.".to_string());
        }

        let mut mime = d.mime;
        if let Some(extra) = cfgf.mime {
            for (ext, mtype) in extra.into_iter() {
                mime.set(ext, mtype);
            }
        }

        if let Some(ref handler) = cfgf.connect_handler {
            if handler.is_relative() {
                log::warn!(
                    "connect_handler {} is relative; it will be looked up from the host directory.",
                    handler.display()
                );
            }
        }

        let secs = |v: Option<u64>, default: Duration| match v {
            Some(n) => Duration::from_secs(n),
            None => default,
        };

        Ok(Cfg {
            root,
            virtual_hosts: cfgf.virtual_hosts.unwrap_or(d.virtual_hosts),
            cgi: cfgf.cgi.unwrap_or(d.cgi),
            dirlist: cfgf.dirlist.unwrap_or(d.dirlist),
            redirect: cfgf.redirect.unwrap_or(d.redirect),
            port_append: cfgf.port_append.unwrap_or(d.port_append),
            connect_handler: cfgf.connect_handler,
            read_timeout: secs(cfgf.read_timeout_secs, d.read_timeout),
            write_timeout: secs(cfgf.write_timeout_secs, d.write_timeout),
            cgi_timeout: secs(cfgf.cgi_timeout_secs, d.cgi_timeout),
            min_send_rate,
            max_request_line: cfgf.max_request_line.unwrap_or(d.max_request_line),
            header_limits,
            max_cgi_header: cfgf.max_cgi_header.unwrap_or(d.max_cgi_header),
            max_post_body: cfgf.max_post_body.unwrap_or(d.max_post_body),
            mime,
        })
    }

    /// Configuration from defaults alone, with `root` canonicalized.
    pub fn defaults() -> Result<Cfg, String> {
        Cfg::from_file(CfgFile::default())
    }

    /// Largest chunk one file-transfer write may carry within `write_timeout`.
    pub fn send_chunk(&self) -> u64 {
        let secs = self.write_timeout.as_secs().max(1);
        self.min_send_rate.saturating_mul(secs).max(1)
    }

    pub fn header_limits(&self) -> Limits {
        self.header_limits
    }

    pub fn cgi_header_limits(&self) -> Limits {
        Limits {
            max_line: self.max_cgi_header,
            max_fields: self.header_limits.max_fields,
            max_block: self.max_cgi_header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Cfg::from_toml(b"").unwrap();
        assert!(cfg.virtual_hosts);
        assert!(!cfg.cgi);
        assert_eq!(cfg.read_timeout, Duration::from_secs(20));
        assert_eq!(cfg.cgi_timeout, Duration::from_secs(300));
        assert_eq!(cfg.send_chunk(), 4096 * 20);
        assert!(cfg.root.is_absolute());
    }

    #[test]
    fn reads_settings() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            r#"
root = "{}"
cgi = true
dirlist = true
virtual_hosts = false
write_timeout_secs = 2
min_send_rate = 100
max_headers = 10

[mime]
md = "text/markdown"
"#,
            dir.path().display()
        );
        let cfg = Cfg::from_toml(text.as_bytes()).unwrap();
        assert!(cfg.cgi && cfg.dirlist && !cfg.virtual_hosts);
        assert_eq!(cfg.send_chunk(), 200);
        assert_eq!(cfg.header_limits.max_fields, 10);
        assert_eq!(cfg.header_limits.max_line, 8192);
        assert_eq!(cfg.mime.mime_type(b"x.md"), "text/markdown");
        assert_eq!(cfg.root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cfg::from_toml(b"min_send_rate = 0").is_err());
        assert!(Cfg::from_toml(b"no_such_key = 1").is_err());
        assert!(Cfg::from_toml(b"root = \"/no/such/dir/anywhere\"").is_err());
    }
}
