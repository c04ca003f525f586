#![allow(dead_code)]

use std::{os::unix::fs::PermissionsExt, path::Path, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use lugburz::{cfg::Cfg, client::Peer, serve_connection};

/// A configuration serving `root` directly, no virtual hosts.
pub fn cfg_for(root: &Path) -> Cfg {
    Cfg {
        root: root.to_path_buf(),
        virtual_hosts: false,
        ..Cfg::default()
    }
}

/// Run one connection whose client sends `input` and then closes.
pub async fn exchange(cfg: &Cfg, input: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let peer = Peer {
        remote_ip: Some("192.0.2.1".to_string()),
        remote_port: Some("40000".to_string()),
        ..Peer::default()
    };
    serve_connection(cfg, &peer, input, &mut out).await.unwrap();
    out
}

/// Run one connection whose client sends `input` and then goes quiet
/// without closing. The connection has to end on its own.
pub async fn stalled_exchange(cfg: &Cfg, input: &[u8]) -> Vec<u8> {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (rd, wr) = tokio::io::split(server);
    client.write_all(input).await.unwrap();

    let peer = Peer::default();
    tokio::time::timeout(
        Duration::from_secs(10),
        serve_connection(cfg, &peer, BufReader::new(rd), wr),
    )
    .await
    .expect("connection outlived its timeouts")
    .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    out
}

pub struct Response {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn code(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .and_then(|c| c.parse().ok())
            .unwrap()
    }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Split a byte stream into responses, using `Content-Length` when present
/// and taking everything that's left otherwise.
pub fn parse_responses(mut bytes: &[u8]) -> Vec<Response> {
    let mut resps = Vec::new();
    while !bytes.is_empty() {
        let end = find(bytes, b"\r\n\r\n").unwrap();
        let head = std::str::from_utf8(&bytes[..end]).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .map(|l| {
                let (n, v) = l.split_once(':').unwrap();
                (n.to_string(), v.trim().to_string())
            })
            .collect();
        bytes = &bytes[end + 4..];

        let len = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse::<usize>().unwrap());
        let is_head_only = status_line.contains(" 304 ");
        let len = match len {
            _ if is_head_only => 0,
            Some(n) => n.min(bytes.len()),
            None => bytes.len(),
        };
        resps.push(Response {
            status_line,
            headers,
            body: bytes[..len].to_vec(),
        });
        bytes = &bytes[len..];
    }
    resps
}

pub fn parse_one(bytes: &[u8]) -> Response {
    let mut resps = parse_responses(bytes);
    assert_eq!(resps.len(), 1, "{}", String::from_utf8_lossy(bytes));
    resps.remove(0)
}

pub fn write_file<P: AsRef<Path>>(path: P, contents: &[u8], mode: u32) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}
