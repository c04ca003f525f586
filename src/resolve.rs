/*!
Mapping a request path onto something that can answer it.
*/
use std::{
    ffi::OsStr,
    fs::Metadata,
    io,
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        fs::MetadataExt,
    },
    path::{Path, PathBuf},
};

use http::StatusCode;

use crate::{cfg::Cfg, host::HostDir, request::Request, LbErr};

static INDEX_HTML: &str = "index.html";
static INDEX_CGI: &str = "index.cgi";

/// A regular file to be served as-is.
#[derive(Debug)]
pub struct StaticFile {
    pub path: PathBuf,
    pub meta: Metadata,
    pub mime: String,
    /// `Content-Encoding` when a pre-compressed variant was chosen.
    pub encoding: Option<&'static str>,
}

/// A program to run through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiTarget {
    pub program: PathBuf,
    /// Request path of the program itself.
    pub script_name: Vec<u8>,
    /// Whatever followed the program's name in the request path.
    pub path_info: Option<Vec<u8>>,
    /// The program writes its own status line.
    pub nph: bool,
}

impl CgiTarget {
    fn new(program: PathBuf, script_name: Vec<u8>, path_info: Option<Vec<u8>>) -> CgiTarget {
        let nph = program
            .file_name()
            .map(|f| f.as_bytes().starts_with(b"nph-"))
            .unwrap_or(false);
        CgiTarget {
            program,
            script_name,
            path_info,
            nph,
        }
    }
}

#[derive(Debug)]
pub enum Resource {
    File(StaticFile),
    Listing(PathBuf),
    Cgi(CgiTarget),
    /// 301 to the contained `Location`.
    Redirect(Vec<u8>),
}

/// Whether the current process may execute the file `md` describes.
pub fn is_executable(md: &Metadata) -> bool {
    // SAFETY: neither call has preconditions or can fail.
    let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
    let bit = if md.uid() == euid {
        0o100
    } else if md.gid() == egid {
        0o010
    } else {
        0o001
    };
    md.is_file() && (md.mode() & bit) != 0
}

fn is_cgi_name(path: &[u8]) -> bool {
    path.ends_with(b".cgi")
}

fn not_found<S: Into<String>>(msg: S) -> LbErr {
    LbErr::from(StatusCode::NOT_FOUND).wrap(msg)
}

/// The target path as the client spelled it, with a `/` appended.
fn slash_location(req: &Request) -> Vec<u8> {
    let (raw_path, query) = match req.target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (req.target.as_str(), None),
    };
    let mut loc = raw_path.as_bytes().to_vec();
    loc.push(b'/');
    if let Some(q) = query {
        loc.push(b'?');
        loc.extend_from_slice(q.as_bytes());
    }
    loc
}

async fn regular_file(p: &Path) -> Option<Metadata> {
    match tokio::fs::metadata(p).await {
        Ok(md) if md.is_file() => Some(md),
        _ => None,
    }
}

/**
Build the `StaticFile` for `path`, swapping in `path.gz` when the client
takes gzip and one exists.
*/
async fn static_file(cfg: &Cfg, req: &Request, path: PathBuf, meta: Metadata) -> StaticFile {
    let name = path.as_os_str().as_bytes();
    let mime = cfg.mime.mime_type(name).to_string();

    if req.accepts_gzip() && !name.ends_with(b".gz") {
        let mut gz = path.clone().into_os_string();
        gz.push(".gz");
        let gz = PathBuf::from(gz);
        if let Some(gz_meta) = regular_file(&gz).await {
            log::debug!("serving {} for {}", gz.display(), path.display());
            return StaticFile {
                path: gz,
                meta: gz_meta,
                mime,
                encoding: Some("gzip"),
            };
        }
    }

    StaticFile {
        path,
        meta,
        mime,
        encoding: None,
    }
}

async fn resolve_dir(cfg: &Cfg, req: &Request, dir: PathBuf) -> Result<Resource, LbErr> {
    let index = dir.join(INDEX_HTML);
    if let Some(meta) = regular_file(&index).await {
        return Ok(Resource::File(static_file(cfg, req, index, meta).await));
    }

    if cfg.cgi {
        let index = dir.join(INDEX_CGI);
        if let Ok(meta) = tokio::fs::metadata(&index).await {
            if is_executable(&meta) {
                let mut script_name = req.path.clone();
                script_name.extend_from_slice(INDEX_CGI.as_bytes());
                return Ok(Resource::Cgi(CgiTarget::new(index, script_name, None)));
            }
        }
    }

    if cfg.dirlist {
        return Ok(Resource::Listing(dir));
    }

    Err(not_found(format!("No index in {}", dir.display())))
}

/// For a path running through a `.cgi` file, split it into program and PATH_INFO.
async fn resolve_path_info(host: &HostDir, path: &[u8]) -> Option<CgiTarget> {
    let idx = path.windows(5).position(|w| w == b".cgi/")?;
    let (script, info) = path.split_at(idx + 4);
    let program = host.local_path(script);
    let meta = tokio::fs::metadata(&program).await.ok()?;
    if !is_executable(&meta) {
        return None;
    }
    Some(CgiTarget::new(program, script.to_vec(), Some(info.to_vec())))
}

/**
Decide what answers `req` within `host`.

In order: directories (index.html, index.cgi, listing, or a slash-appending
redirect), executable `*.cgi` programs (with PATH_INFO split off), static
files, and with `redirect` set, dangling symlinks. Everything else is 404.
*/
pub async fn resolve(cfg: &Cfg, host: &HostDir, req: &Request) -> Result<Resource, LbErr> {
    log::trace!("resolve( {:?}, {:?} ) called.", &host.root, &req.path_lossy());

    let local = host.local_path(&req.path);

    match tokio::fs::metadata(&local).await {
        Ok(md) if md.is_dir() => {
            if req.path.ends_with(b"/") {
                resolve_dir(cfg, req, local).await
            } else {
                Ok(Resource::Redirect(slash_location(req)))
            }
        }
        Ok(md) if md.is_file() => {
            if cfg.cgi && is_cgi_name(&req.path) && is_executable(&md) {
                Ok(Resource::Cgi(CgiTarget::new(local, req.path.clone(), None)))
            } else {
                Ok(Resource::File(static_file(cfg, req, local, md).await))
            }
        }
        Ok(_) => Err(not_found(format!("{} is not a regular file", local.display()))),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) && cfg.cgi => {
            match resolve_path_info(host, &req.path).await {
                Some(target) => Ok(Resource::Cgi(target)),
                None => Err(not_found(format!("{}: {}", local.display(), &e))),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound && cfg.redirect => {
            match tokio::fs::read_link(&local).await {
                Ok(link) => Ok(Resource::Redirect(link.into_os_string().into_vec())),
                Err(_) => Err(not_found(format!("{}: {}", local.display(), &e))),
            }
        }
        Err(e) => Err(not_found(format!("{}: {}", local.display(), &e))),
    }
}

/// File name bytes as shown to clients; `:` stands in for a leading `.`.
pub fn display_name(name: &OsStr) -> Vec<u8> {
    let mut v = name.as_bytes().to_vec();
    if v.first() == Some(&b':') {
        v[0] = b'.';
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{header::Field, request::parse_request_line};
    use std::os::unix::fs::PermissionsExt;

    fn request(target: &str, headers: &[(&str, &str)]) -> Request {
        let line = format!("GET {} HTTP/1.1", target);
        let line = parse_request_line(line.as_bytes(), false).unwrap();
        let fields = headers
            .iter()
            .map(|(n, v)| Field {
                name: n.to_string(),
                value: v.as_bytes().to_vec(),
            })
            .collect();
        Request::from_parts(line, fields, &Cfg::default()).unwrap()
    }

    fn write_exec(p: &Path, text: &str) {
        std::fs::write(p, text).unwrap();
        std::fs::set_permissions(p, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        host: HostDir,
        cfg: Cfg,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("a.txt"), "hello").unwrap();
        std::fs::write(root.join("b.html"), "<p>plain</p>").unwrap();
        std::fs::write(root.join("b.html.gz"), "not really gzip").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::create_dir(root.join("app")).unwrap();
        write_exec(&root.join("app/run.cgi"), "#!/bin/sh\n");
        write_exec(&root.join("app/index.cgi"), "#!/bin/sh\n");
        write_exec(&root.join("app/nph-raw.cgi"), "#!/bin/sh\n");
        std::fs::write(root.join("app/data.cgi"), "not executable").unwrap();
        std::os::unix::fs::symlink("http://moved.example/", root.join("gone")).unwrap();

        let cfg = Cfg {
            root: root.clone(),
            cgi: true,
            ..Cfg::default()
        };
        Fixture {
            _dir: dir,
            host: HostDir {
                name: "test".to_string(),
                root,
            },
            cfg,
        }
    }

    #[tokio::test]
    async fn files_and_directories() {
        let f = fixture();
        match resolve(&f.cfg, &f.host, &request("/a.txt", &[])).await.unwrap() {
            Resource::File(sf) => {
                assert_eq!(sf.path, f.host.root.join("a.txt"));
                assert_eq!(sf.mime, "text/plain; charset=UTF-8");
                assert!(sf.encoding.is_none());
            }
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/sub?x=1", &[])).await.unwrap() {
            Resource::Redirect(loc) => assert_eq!(loc, b"/sub/?x=1".to_vec()),
            x => panic!("unexpected {:?}", x),
        }
        let e = resolve(&f.cfg, &f.host, &request("/sub/", &[])).await.unwrap_err();
        assert_eq!(e.code(), StatusCode::NOT_FOUND);

        let cfg = Cfg {
            dirlist: true,
            ..f.cfg.clone()
        };
        match resolve(&cfg, &f.host, &request("/sub/", &[])).await.unwrap() {
            Resource::Listing(p) => assert_eq!(p, f.host.root.join("sub")),
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn gzip_variant() {
        let f = fixture();
        let req = request("/b.html", &[("Accept-Encoding", "gzip, deflate")]);
        match resolve(&f.cfg, &f.host, &req).await.unwrap() {
            Resource::File(sf) => {
                assert_eq!(sf.path, f.host.root.join("b.html.gz"));
                assert_eq!(sf.encoding, Some("gzip"));
                assert_eq!(sf.mime, "text/html; charset=UTF-8");
            }
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/b.html.gz", &[])).await.unwrap() {
            Resource::File(sf) => {
                assert_eq!(sf.mime, "application/octet-stream");
                assert!(sf.encoding.is_none());
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn cgi_programs() {
        let f = fixture();
        match resolve(&f.cfg, &f.host, &request("/app/run.cgi", &[])).await.unwrap() {
            Resource::Cgi(t) => {
                assert_eq!(t.script_name, b"/app/run.cgi".to_vec());
                assert_eq!(t.path_info, None);
                assert!(!t.nph);
            }
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/app/run.cgi/extra/bits", &[]))
            .await
            .unwrap()
        {
            Resource::Cgi(t) => {
                assert_eq!(t.program, f.host.root.join("app/run.cgi"));
                assert_eq!(t.path_info, Some(b"/extra/bits".to_vec()));
            }
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/app/", &[])).await.unwrap() {
            Resource::Cgi(t) => assert_eq!(t.script_name, b"/app/index.cgi".to_vec()),
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/app/nph-raw.cgi", &[])).await.unwrap() {
            Resource::Cgi(t) => assert!(t.nph),
            x => panic!("unexpected {:?}", x),
        }
        match resolve(&f.cfg, &f.host, &request("/app/data.cgi", &[])).await.unwrap() {
            Resource::File(_) => {}
            x => panic!("unexpected {:?}", x),
        }

        let cfg = Cfg {
            cgi: false,
            ..f.cfg.clone()
        };
        let e = resolve(&cfg, &f.host, &request("/app/run.cgi/extra", &[]))
            .await
            .unwrap_err();
        assert_eq!(e.code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn symlink_redirects_and_containment() {
        let f = fixture();
        let e = resolve(&f.cfg, &f.host, &request("/gone", &[])).await.unwrap_err();
        assert_eq!(e.code(), StatusCode::NOT_FOUND);

        let cfg = Cfg {
            redirect: true,
            ..f.cfg.clone()
        };
        match resolve(&cfg, &f.host, &request("/gone", &[])).await.unwrap() {
            Resource::Redirect(loc) => assert_eq!(loc, b"http://moved.example/".to_vec()),
            x => panic!("unexpected {:?}", x),
        }

        let e = resolve(&f.cfg, &f.host, &request("/../../../../etc/passwd", &[]))
            .await
            .unwrap_err();
        assert_eq!(e.code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn names_for_display() {
        assert_eq!(display_name(OsStr::new(":profile")), b".profile".to_vec());
        assert_eq!(display_name(OsStr::new("a:b")), b"a:b".to_vec());
    }
}
