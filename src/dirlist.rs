/*!
HTML directory listings.
*/
use std::{
    borrow::Cow,
    ffi::OsStr,
    os::unix::{ffi::OsStrExt, fs::PermissionsExt},
    path::Path,
};

use http::StatusCode;

use crate::{resolve::display_name, LbErr};

/// Others must be able to read and search a directory for it to be listed.
const WORLD_RX: u32 = 0o005;

fn push_html(v: &mut Vec<u8>, s: &[u8]) {
    for c in String::from_utf8_lossy(s).chars() {
        match c {
            '&' => v.extend_from_slice(b"&amp;"),
            '<' => v.extend_from_slice(b"&lt;"),
            '>' => v.extend_from_slice(b"&gt;"),
            '"' => v.extend_from_slice(b"&quot;"),
            c if c.is_control() => v.push(b'_'),
            c => {
                let mut buf = [0u8; 4];
                v.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

/// Percent-encode anything that can't sit unquoted in an href attribute.
fn push_href(v: &mut Vec<u8>, s: &[u8]) {
    for &b in s {
        if b > 32 && b < 127 && b != b'%' && b != b'"' {
            v.push(b);
        } else {
            v.extend_from_slice(format!("%{:02x}", b).as_bytes());
        }
    }
}

/// Show `:` segment prefixes the way the client wrote them.
fn display_path(path: &[u8]) -> Cow<'_, [u8]> {
    if !path.windows(2).any(|w| w == b"/:") {
        return Cow::Borrowed(path);
    }
    let mut v = path.to_vec();
    for n in 1..v.len() {
        if v[n] == b':' && v[n - 1] == b'/' {
            v[n] = b'.';
        }
    }
    Cow::Owned(v)
}

fn parent_of(path: &[u8]) -> Option<&[u8]> {
    let trimmed = path.strip_suffix(b"/").unwrap_or(path);
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .iter()
        .rposition(|&b| b == b'/')
        .map(|n| &trimmed[..=n])
}

enum Kind {
    Dir,
    Link(Vec<u8>),
    File,
}

/**
Render the listing of `dir`, which was requested as `req_path`.

Hidden entries are left out, as is anything that is not a directory,
symlink, or regular file. Symlinks link to their targets.
*/
pub async fn render(dir: &Path, req_path: &[u8]) -> Result<Vec<u8>, LbErr> {
    log::trace!(
        "dirlist::render( {}, {:?} ) called.",
        dir.display(),
        String::from_utf8_lossy(req_path)
    );

    let not_found = |msg: String| LbErr::from(StatusCode::NOT_FOUND).wrap(msg);

    let md = tokio::fs::metadata(dir)
        .await
        .map_err(|e| not_found(format!("{}: {}", dir.display(), &e)))?;
    if !md.is_dir() || (md.permissions().mode() & WORLD_RX) != WORLD_RX {
        return Err(not_found(format!("{} is not listable", dir.display())));
    }

    let mut entries: Vec<(Vec<u8>, Kind)> = Vec::new();
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| not_found(format!("Unable to read {}: {}", dir.display(), &e)))?;
    loop {
        let ent = match rd.next_entry().await {
            Ok(Some(ent)) => ent,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Error reading entry in {}: {}", dir.display(), &e);
                break;
            }
        };
        let name = ent.file_name();
        if name.as_bytes().starts_with(b".") {
            continue;
        }
        let path = ent.path();
        let lmd = match tokio::fs::symlink_metadata(&path).await {
            Ok(lmd) => lmd,
            Err(_) => continue,
        };
        let ft = lmd.file_type();
        let kind = if ft.is_dir() {
            Kind::Dir
        } else if ft.is_symlink() {
            match tokio::fs::read_link(&path).await {
                Ok(target) => Kind::Link(target.as_os_str().as_bytes().to_vec()),
                Err(_) => continue,
            }
        } else if ft.is_file() {
            Kind::File
        } else {
            continue;
        };
        entries.push((name.as_bytes().to_vec(), kind));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let shown = display_path(req_path);
    let mut v: Vec<u8> = Vec::with_capacity(256 + 64 * entries.len());
    v.extend_from_slice(b"<h3>Directory Listing: ");
    push_html(&mut v, &shown);
    v.extend_from_slice(b"</h3>\n<pre>\n");

    if let Some(parent) = parent_of(req_path) {
        v.extend_from_slice(b"<a href=\"");
        push_href(&mut v, parent);
        v.extend_from_slice(b"\">Parent directory</a>\n");
    }

    for (name, kind) in entries.iter() {
        let shown = display_name(OsStr::from_bytes(name));
        let (marker, href): (&[u8], &[u8]) = match kind {
            Kind::Dir => (&b"[DIR] "[..], &shown[..]),
            Kind::Link(target) => (&b"[LNK] "[..], &target[..]),
            Kind::File => (&b"[TXT] "[..], &shown[..]),
        };
        v.extend_from_slice(marker);
        v.extend_from_slice(b"<a href=\"");
        push_href(&mut v, href);
        if let Kind::Dir = kind {
            v.push(b'/');
        }
        v.extend_from_slice(b"\">");
        push_html(&mut v, &shown);
        v.extend_from_slice(b"</a>\n");
    }
    v.extend_from_slice(b"</pre>\n");

    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents() {
        assert_eq!(parent_of(b"/"), None);
        assert_eq!(parent_of(b"/a/"), Some(&b"/"[..]));
        assert_eq!(parent_of(b"/a/b/"), Some(&b"/a/"[..]));
    }

    #[test]
    fn escaping() {
        let mut v = Vec::new();
        push_html(&mut v, b"<a & \"b\">\x01");
        assert_eq!(v, b"&lt;a &amp; &quot;b&quot;&gt;_".to_vec());

        let mut v = Vec::new();
        push_href(&mut v, b"../some dir/f%.txt");
        assert_eq!(v, b"../some%20dir/f%25.txt".to_vec());
        let mut v = Vec::new();
        push_href(&mut v, "http://x/\u{e9}".as_bytes());
        assert_eq!(v, b"http://x/%c3%a9".to_vec());

        assert_eq!(display_path(b"/a/:hidden/"), Cow::Borrowed(&b"/a/.hidden/"[..]));
    }

    #[tokio::test]
    async fn lists_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("b.txt"), "b").unwrap();
        std::fs::write(root.join(".secret"), "x").unwrap();
        std::fs::write(root.join(":dotted"), "x").unwrap();
        std::os::unix::fs::symlink("http://x.example/", root.join("link")).unwrap();

        std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o700)).unwrap();
        let e = render(root, b"/d/").await.unwrap_err();
        assert_eq!(e.code(), StatusCode::NOT_FOUND);

        std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o755)).unwrap();
        let page = String::from_utf8(render(root, b"/d/").await.unwrap()).unwrap();
        let expected = "<h3>Directory Listing: /d/</h3>\n<pre>\n\
            <a href=\"/\">Parent directory</a>\n\
            [TXT] <a href=\".dotted\">.dotted</a>\n\
            [TXT] <a href=\"b.txt\">b.txt</a>\n\
            [LNK] <a href=\"http://x.example/\">link</a>\n\
            [DIR] <a href=\"sub/\">sub</a>\n\
            </pre>\n";
        assert_eq!(page, expected);
    }
}
