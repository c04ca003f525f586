use std::collections::BTreeMap;

static DEFAULT: &[(&str, &str)] = &[
    ("avi", "video/x-msvideo"),
    ("css", "text/css"),
    ("dtd", "text/xml"),
    ("dvi", "application/x-dvi"),
    ("epub", "application/epub+zip"),
    ("gif", "image/gif"),
    ("htm", "text/html; charset=UTF-8"),
    ("html", "text/html; charset=UTF-8"),
    ("ico", "image/x-icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("ogg", "audio/ogg"),
    ("pac", "application/x-ns-proxy-autoconfig"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("ps", "application/postscript"),
    ("qt", "video/quicktime"),
    ("sig", "application/pgp-signature"),
    ("svg", "image/svg+xml"),
    ("swf", "application/x-shockwave-flash"),
    ("tar", "application/x-tar"),
    ("torrent", "application/x-bittorrent"),
    ("txt", "text/plain; charset=UTF-8"),
    ("wasm", "application/wasm"),
    ("wav", "audio/x-wav"),
    ("webp", "image/webp"),
    ("woff2", "font/woff2"),
    ("xbm", "image/x-xbitmap"),
    ("xml", "text/xml"),
    ("xpm", "image/x-xpixmap"),
    ("xwd", "image/x-xwindowdump"),
    ("zip", "application/zip"),
];

pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Debug)]
pub struct MimeMap {
    map: BTreeMap<String, String>,
}

impl MimeMap {
    pub fn set<K, V>(&mut self, k: K, v: V)
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let k = k.as_ref().to_ascii_lowercase();
        _ = self.map.insert(k, v.into());
    }

    pub fn get(&self, ext: &str) -> Option<&str> {
        self.map
            .get(&ext.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /**
    The Content-Type for a file name, judged by its last extension.

    Compressed archives asked for by name (`.gz`, `.bz2`) are always
    `application/octet-stream` so clients save rather than decode them.
    Unknown extensions get the same.
    */
    pub fn mime_type(&self, file_name: &[u8]) -> &str {
        match extension(file_name) {
            Some(b"gz") | Some(b"bz2") => OCTET_STREAM,
            Some(ext) => std::str::from_utf8(ext)
                .ok()
                .and_then(|e| self.get(e))
                .unwrap_or(OCTET_STREAM),
            None => OCTET_STREAM,
        }
    }
}

/// The bytes after the last `.` of the final path segment.
fn extension(name: &[u8]) -> Option<&[u8]> {
    let base = match name.iter().rposition(|&b| b == b'/') {
        Some(n) => &name[n + 1..],
        None => name,
    };
    base.iter().rposition(|&b| b == b'.').map(|n| &base[n + 1..])
}

impl Default for MimeMap {
    fn default() -> Self {
        let map: BTreeMap<String, String> = DEFAULT
            .iter()
            .map(|(k, v)| (String::from(*k), String::from(*v)))
            .collect();

        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        let m = MimeMap::default();
        assert_eq!(m.mime_type(b"/index.html"), "text/html; charset=UTF-8");
        assert_eq!(m.mime_type(b"/a.b/PIC.PNG"), "image/png");
        assert_eq!(m.mime_type(b"/a.b/README"), OCTET_STREAM);
        assert_eq!(m.mime_type(b"/x.unknown"), OCTET_STREAM);
        assert_eq!(m.mime_type(b"/tarball.tar.gz"), OCTET_STREAM);
        assert_eq!(m.mime_type(b"/thing.bz2"), OCTET_STREAM);
    }

    #[test]
    fn overrides() {
        let mut m = MimeMap::default();
        m.set("TXT", "text/plain");
        m.set("md", "text/markdown");
        assert_eq!(m.mime_type(b"notes.txt"), "text/plain");
        assert_eq!(m.mime_type(b"notes.md"), "text/markdown");
    }
}
