mod common;

use std::{path::PathBuf, time::Duration};

use once_cell::sync::Lazy;
use tempfile::TempDir;

use common::{cfg_for, exchange, parse_one, write_file};
use lugburz::{cfg::Cfg, SERVER};

/// Every program any test runs, all written before the first one starts.
static SITE: Lazy<TempDir> = Lazy::new(|| {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let scripts: &[(&str, &str)] = &[
        (
            "status.cgi",
            "printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\nmade'",
        ),
        ("plain.cgi", "printf 'Content-Type: text/plain\\n\\nhello'"),
        (
            "redirect.cgi",
            "printf 'Content-Type: text/plain\\r\\nLocation: http://example.org/\\r\\n\\r\\nignored'",
        ),
        ("slow.cgi", "exec sleep 5"),
        (
            "stall.cgi",
            "printf 'Content-Type: text/plain\\n\\npartial'\n\
             exec sleep 5",
        ),
        (
            "early-location.cgi",
            "printf 'Location: http://example.org/\\n'\n\
             exec sleep 5",
        ),
        (
            "echo.cgi",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             printf '%s|%s|%s|%s|' \"$REQUEST_METHOD\" \"$CONTENT_LENGTH\" \"$QUERY_STRING\" \"$CONTENT_TYPE\"\n\
             exec cat",
        ),
        (
            "env.cgi",
            "printf 'Content-Type: text/plain\\n\\n'\n\
             printf '%s\\n' \"$GATEWAY_INTERFACE\" \"$SERVER_PROTOCOL\" \"$SERVER_SOFTWARE\" \
             \"$SERVER_NAME\" \"$SERVER_PORT\" \"$REQUEST_URI\" \"$SCRIPT_NAME\" \"$PATH_INFO\" \
             \"$REMOTE_ADDR\" \"$REMOTE_PORT\" \"$HTTP_X_CUSTOM_THING\" \"$1\" \"$2\"",
        ),
        (
            "nph-raw.cgi",
            "printf 'HTTP/1.0 299 Odd\\r\\nX-Raw: 1\\r\\n\\r\\nraw'",
        ),
        (
            "slurp.cgi",
            "body=$(cat)\n\
             printf 'Content-Type: text/plain\\n\\n%s' \"$body\"",
        ),
        ("silent.cgi", "exit 0"),
        ("noheader.cgi", "printf 'no header block here'"),
        ("badstatus.cgi", "printf 'Status: 42 Nope\\n\\n'"),
        ("dir/index.cgi", "printf 'Content-Type: text/plain\\n\\nindex program'"),
        (
            "tunnel.sh",
            "printf 'HTTP/1.0 200 Connection established\\r\\n\\r\\n'\n\
             printf '%s ' \"$REQUEST_METHOD\" \"$REQUEST_URI\"\n\
             exec cat",
        ),
    ];
    for (name, body) in scripts {
        let text = format!("#!/bin/sh\n{}\n", body);
        write_file(root.join(name), text.as_bytes(), 0o755);
    }
    write_file(root.join("noexec.cgi"), b"#!/bin/sh\necho nope\n", 0o644);
    dir
});

fn cgi_cfg() -> Cfg {
    let mut cfg = cfg_for(SITE.path());
    cfg.cgi = true;
    cfg
}

fn body_str(body: &[u8]) -> &str {
    std::str::from_utf8(body).unwrap()
}

#[tokio::test]
async fn status_from_program() {
    let out = exchange(&cgi_cfg(), b"GET /status.cgi HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let r = parse_one(&out);
    assert_eq!(r.status_line, "HTTP/1.1 201 Created");
    assert_eq!(r.header("Server"), Some(SERVER.as_str()));
    assert_eq!(r.header("Connection"), Some("close"));
    assert_eq!(r.header("Content-Type"), Some("text/plain"));
    assert!(r.header("Pragma").is_none());
    assert_eq!(r.body, b"made");
}

#[tokio::test]
async fn default_status_is_uncached_ok() {
    let out = exchange(&cgi_cfg(), b"GET /plain.cgi HTTP/1.0\r\n\r\n").await;
    let r = parse_one(&out);
    assert_eq!(r.status_line, "HTTP/1.0 200 OK");
    assert_eq!(r.header("Pragma"), Some("no-cache"));
    assert_eq!(r.body, b"hello");
}

#[tokio::test]
async fn location_is_all_that_is_sent() {
    let out = exchange(&cgi_cfg(), b"GET /redirect.cgi HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.1 302 Found\r\nLocation: http://example.org/\r\n\r\n"
    );
}

#[tokio::test]
async fn idle_program_times_out() {
    let mut cfg = cgi_cfg();
    cfg.cgi_timeout = Duration::from_millis(300);
    let r = parse_one(&exchange(&cfg, b"GET /slow.cgi HTTP/1.0\r\n\r\n").await);
    assert_eq!(r.code(), 504);
}

#[tokio::test]
async fn program_stalling_mid_body_is_cut_short() {
    let mut cfg = cgi_cfg();
    cfg.cgi_timeout = Duration::from_millis(300);
    let out = exchange(&cfg, b"GET /stall.cgi HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let text = String::from_utf8(out.clone()).unwrap();
    assert_eq!(text.matches("HTTP/1.1 ").count(), 1, "{}", &text);

    let r = parse_one(&out);
    assert_eq!(r.code(), 200);
    assert_eq!(r.header("Connection"), Some("close"));
    assert_eq!(r.body, b"partial");
}

#[tokio::test]
async fn location_goes_out_before_header_block_ends() {
    let mut cfg = cgi_cfg();
    cfg.cgi_timeout = Duration::from_secs(3);
    let started = std::time::Instant::now();
    let out = exchange(&cfg, b"GET /early-location.cgi HTTP/1.0\r\n\r\n").await;
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.0 302 Found\r\nLocation: http://example.org/\r\n\r\n"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn post_body_reaches_program() {
    let input = b"POST /echo.cgi?x=y HTTP/1.1\r\nHost: x\r\n\
        Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\n\
        a=1&b=2GET /plain.cgi HTTP/1.1\r\n\r\n";
    let r = parse_one(&exchange(&cgi_cfg(), input).await);
    assert_eq!(r.code(), 200);
    assert_eq!(
        body_str(&r.body),
        "POST|7|x=y|application/x-www-form-urlencoded|a=1&b=2"
    );
}

#[tokio::test]
async fn short_post_body_is_a_hangup() {
    let input = b"POST /slurp.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 50\r\n\r\nshort";
    assert!(exchange(&cgi_cfg(), input).await.is_empty());

    let input = b"POST /slurp.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nwhole";
    let r = parse_one(&exchange(&cgi_cfg(), input).await);
    assert_eq!(r.body, b"whole");
}

#[tokio::test]
async fn program_environment() {
    let input = b"GET /env.cgi/extra/bits?one+two HTTP/1.1\r\nHost: WWW.Example.COM\r\n\
        X-Custom-Thing: yes\r\nConnection: close\r\n\r\n";
    let r = parse_one(&exchange(&cgi_cfg(), input).await);
    assert_eq!(r.code(), 200);
    let lines: Vec<&str> = body_str(&r.body).lines().collect();
    assert_eq!(
        lines,
        vec![
            "CGI/1.1",
            "HTTP/1.1",
            SERVER.as_str(),
            "www.example.com",
            "80",
            "/env.cgi/extra/bits",
            "/env.cgi",
            "/extra/bits",
            "192.0.2.1",
            "40000",
            "yes",
            "one",
            "two",
        ]
    );
}

#[tokio::test]
async fn nph_output_passes_through() {
    let out = exchange(&cgi_cfg(), b"GET /nph-raw.cgi HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(out, b"HTTP/1.0 299 Odd\r\nX-Raw: 1\r\n\r\nraw".to_vec());
}

#[tokio::test]
async fn broken_programs() {
    let cfg = cgi_cfg();
    for target in ["/silent.cgi", "/noheader.cgi"] {
        let req = format!("GET {} HTTP/1.0\r\n\r\n", target);
        let r = parse_one(&exchange(&cfg, req.as_bytes()).await);
        assert_eq!(r.code(), 502, "{}", target);
    }

    let r = parse_one(&exchange(&cfg, b"GET /badstatus.cgi HTTP/1.0\r\n\r\n").await);
    assert_eq!(r.code(), 500);

    let r = parse_one(&exchange(&cfg, b"HEAD /plain.cgi HTTP/1.0\r\n\r\n").await);
    assert_eq!(r.code(), 405);
    assert!(r.body.is_empty());
}

#[tokio::test]
async fn what_is_not_a_program() {
    let cfg = cgi_cfg();
    // Not executable: served as a file.
    let r = parse_one(&exchange(&cfg, b"GET /noexec.cgi HTTP/1.0\r\n\r\n").await);
    assert_eq!(r.code(), 200);
    assert_eq!(r.body, b"#!/bin/sh\necho nope\n");

    // Gateway off: the program's text is served.
    let r = parse_one(&exchange(&cfg_for(SITE.path()), b"GET /plain.cgi HTTP/1.0\r\n\r\n").await);
    assert!(body_str(&r.body).starts_with("#!/bin/sh"));

    let r = parse_one(&exchange(&cfg, b"GET /dir/ HTTP/1.0\r\n\r\n").await);
    assert_eq!(r.body, b"index program");
}

#[tokio::test]
async fn connect_tunnels_through_handler() {
    let mut cfg = cgi_cfg();
    let input = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nping";

    let r = parse_one(&exchange(&cfg, input).await);
    assert_eq!(r.code(), 405);

    cfg.connect_handler = Some(PathBuf::from("tunnel.sh"));
    let out = exchange(&cfg, input).await;
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.0 200 Connection established\r\n\r\nCONNECT example.com:443 ping"
    );
}
