/*!
The access log: one line per answered request.

```text
IP STATUS BYTES HOST USER-AGENT REFERER PATH
```

Fields never contain whitespace (it becomes `_`); missing ones are `-`.
Lines go to the `lugburz::access` target at `info` level.
*/
use std::fmt::Write;

use crate::client::Peer;

pub const TARGET: &str = "lugburz::access";

const UNKNOWN_IP: &str = "0.0.0.0";

/// What one access log line records.
#[derive(Debug, Default)]
pub struct Entry<'a> {
    pub status: u16,
    pub bytes: u64,
    pub host: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub path: Option<&'a str>,
}

fn push_field(line: &mut String, val: Option<&str>) {
    line.push(' ');
    match val {
        Some(v) if !v.is_empty() => line.extend(v.chars().map(|c| {
            if c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })),
        _ => line.push('-'),
    }
}

pub fn format_entry(peer: &Peer, entry: &Entry<'_>) -> String {
    let mut line = String::with_capacity(128);
    line.push_str(peer.remote_ip.as_deref().unwrap_or(UNKNOWN_IP));
    // Writing to a String can't fail.
    let _ = write!(&mut line, " {} {}", entry.status, entry.bytes);
    push_field(&mut line, entry.host);
    push_field(&mut line, entry.user_agent);
    push_field(&mut line, entry.referer);
    push_field(&mut line, entry.path);
    line
}

pub fn log_request(peer: &Peer, entry: &Entry<'_>) {
    log::info!(target: TARGET, "{}", format_entry(peer, entry));
}
