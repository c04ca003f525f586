/*!
One client connection: reading requests off it one after another and
answering each until one of them, or the client, ends it.

Nothing about a request outlives its response. The only state carried from
one request to the next is the connection itself and the children still
waiting to be reaped.
*/
use std::io;

use http::{header::HeaderValue, Method, StatusCode, Version};
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt},
    time::timeout,
};

use crate::{
    cfg::Cfg,
    cgi::{self, Context, Job},
    client::{flush_timed, write_all_timed, ClientSink, Peer},
    dirlist,
    host::{select_dir, server_name, HostChoice, HostDir},
    reap::Reaper,
    request::{parse_request_line, read_header_fields, read_request_line, Request},
    resolve::{resolve, Resource, StaticFile},
    resp::{canned_html, error_response, ResponseHead},
    rlog::{log_request, Entry},
    serve::{plan_file, send_file},
    LbErr,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Next {
    KeepAlive,
    Close,
}

/// What went out in answer to a request.
struct Answer {
    status: u16,
    bytes: u64,
    next: Next,
}

/// Whether the connection can carry another request after this one.
fn keep_alive(req: &Request) -> bool {
    // An unread body would be taken for the next request.
    req.keep_alive && req.content_length == 0
}

pub struct Connection<'c, R, W> {
    cfg: &'c Cfg,
    peer: &'c Peer,
    input: R,
    output: W,
    reaper: Reaper,
}

impl<'c, R, W> Connection<'c, R, W>
where
    R: AsyncBufRead + Unpin,
    W: ClientSink,
{
    pub fn new(cfg: &'c Cfg, peer: &'c Peer, input: R, output: W) -> Connection<'c, R, W> {
        Connection {
            cfg,
            peer,
            input,
            output,
            reaper: Reaper::new(),
        }
    }

    /// Answer requests until the connection should close, then close it.
    pub async fn serve(mut self) -> io::Result<()> {
        log::trace!("Connection::serve() called for {:?}.", &self.peer.remote_ip);

        let mut served: usize = 0;
        while self.cycle().await == Next::KeepAlive {
            served += 1;
        }
        log::debug!("Closing connection after {} kept-alive requests.", served);

        match timeout(self.cfg.write_timeout, self.output.shutdown()).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "shutdown timed out",
            )),
        }
    }

    async fn cycle(&mut self) -> Next {
        self.reaper.reap();
        let cfg = self.cfg;

        let line = match timeout(
            cfg.read_timeout,
            read_request_line(&mut self.input, cfg.max_request_line),
        )
        .await
        {
            Err(_) => {
                log::debug!("Client idle for {:?}; closing.", cfg.read_timeout);
                return Next::Close;
            }
            Ok(Ok(None)) => return Next::Close,
            Ok(Ok(Some(line))) => line,
            Ok(Err(e)) => return self.fail(e, Version::HTTP_10, None, None).await,
        };

        let line = match parse_request_line(&line, cfg.connect_handler.is_some()) {
            Ok(line) => line,
            Err(e) => return self.fail(e, Version::HTTP_10, None, None).await,
        };
        let version = line.version;

        let fields = match timeout(cfg.read_timeout, read_header_fields(&mut self.input, cfg)).await
        {
            Err(_) => {
                let e = LbErr::from(StatusCode::REQUEST_TIMEOUT)
                    .wrap("Timed out reading request headers.");
                return self.fail(e, version, None, None).await;
            }
            Ok(Err(e)) => return self.fail(e, version, None, None).await,
            Ok(Ok(fields)) => fields,
        };

        let req = match Request::from_parts(line, fields, cfg) {
            Ok(req) => req,
            Err(e) => return self.fail(e, version, None, None).await,
        };
        let name = match server_name(cfg, &req, self.peer) {
            Ok(name) => name,
            Err(e) => return self.fail(e, version, Some(&req), None).await,
        };

        match self.respond(&req, &name).await {
            Ok(ans) => {
                let path = req.path_lossy();
                log_request(
                    self.peer,
                    &Entry {
                        status: ans.status,
                        bytes: ans.bytes,
                        host: Some(&name),
                        user_agent: req.user_agent.as_deref(),
                        referer: req.referer.as_deref(),
                        path: Some(&path),
                    },
                );
                ans.next
            }
            Err(e) => self.fail(e, version, Some(&req), Some(&name)).await,
        }
    }

    /// Send the error response `e` calls for (if the client is still
    /// there), log it, and close.
    async fn fail(
        &mut self,
        e: LbErr,
        version: Version,
        req: Option<&Request>,
        host: Option<&str>,
    ) -> Next {
        if e.is_hangup() {
            log::debug!("{}", &e);
            return Next::Close;
        }
        if e.code().is_server_error() {
            log::error!("{}", &e);
        } else {
            log::debug!("{}", &e);
        }

        let with_body = !req.map(Request::is_head).unwrap_or(false);
        let resp = error_response(&e, version, with_body);
        if let Err(e) = self.send(&resp).await {
            log::debug!("{}", &e);
            return Next::Close;
        }
        if let Err(e) = flush_timed(&mut self.output, self.cfg.write_timeout).await {
            log::debug!("Error flushing error response: {}", &e);
        }

        let bytes = if with_body {
            canned_html(e.code()).len() as u64
        } else {
            0
        };
        let path = req.map(Request::path_lossy);
        log_request(
            self.peer,
            &Entry {
                status: e.code().as_u16(),
                bytes,
                host,
                user_agent: req.and_then(|r| r.user_agent.as_deref()),
                referer: req.and_then(|r| r.referer.as_deref()),
                path: path.as_deref(),
            },
        );
        Next::Close
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), LbErr> {
        write_all_timed(&mut self.output, data, self.cfg.write_timeout)
            .await
            .map_err(|e| LbErr::hangup(format!("Error writing response: {}", &e)))
    }

    async fn flush(&mut self) -> Result<(), LbErr> {
        flush_timed(&mut self.output, self.cfg.write_timeout)
            .await
            .map_err(|e| LbErr::hangup(format!("Error flushing response: {}", &e)))
    }

    async fn respond(&mut self, req: &Request, name: &str) -> Result<Answer, LbErr> {
        log::trace!(
            "Connection::respond( {} {:?}, {:?} ) called.",
            req.method,
            req.path_lossy(),
            name
        );
        let cfg = self.cfg;

        let host = match select_dir(cfg, name, &req.path).await? {
            HostChoice::Dir(host) => host,
            HostChoice::Redirect(loc) => {
                return self.redirect(req, StatusCode::MOVED_PERMANENTLY, &loc).await;
            }
        };

        if req.method == Method::CONNECT {
            let job = Job::tunnel(cfg, &host)?;
            return self.gateway(req, &host, &job).await;
        }

        match resolve(cfg, &host, req).await? {
            Resource::File(file) => self.file(req, file).await,
            Resource::Listing(dir) => self.listing(req, &dir).await,
            Resource::Cgi(target) => self.gateway(req, &host, &Job::from(target)).await,
            Resource::Redirect(loc) => {
                self.redirect(req, StatusCode::MOVED_PERMANENTLY, &loc).await
            }
        }
    }

    async fn file(&mut self, req: &Request, file: StaticFile) -> Result<Answer, LbErr> {
        let keep = keep_alive(req);
        let plan = plan_file(req, file)?;
        self.send(&plan.head.encode(req.version, keep)).await?;

        let bytes = if plan.send_body {
            send_file(&mut self.output, &plan, self.cfg)
                .await
                .map_err(|e| {
                    LbErr::hangup(format!("Error sending {}: {}", plan.path.display(), &e))
                })?
        } else {
            self.flush().await?;
            0
        };

        Ok(Answer {
            status: plan.head.code().as_u16(),
            bytes,
            next: if keep { Next::KeepAlive } else { Next::Close },
        })
    }

    async fn listing(&mut self, req: &Request, dir: &std::path::Path) -> Result<Answer, LbErr> {
        if req.method == Method::POST {
            return Err(LbErr::from(StatusCode::METHOD_NOT_ALLOWED)
                .with_header("Allow", "GET, HEAD")
                .wrap("POST to a directory listing."));
        }
        let keep = keep_alive(req);
        let body = dirlist::render(dir, &req.path).await?;
        let head = ResponseHead::new(StatusCode::OK)
            .header("Content-Type", "text/html; charset=UTF-8")
            .header("Content-Length", body.len());
        self.send(&head.encode(req.version, keep)).await?;

        let bytes = if req.is_head() {
            0
        } else {
            self.send(&body).await?;
            body.len() as u64
        };
        self.flush().await?;

        Ok(Answer {
            status: StatusCode::OK.as_u16(),
            bytes,
            next: if keep { Next::KeepAlive } else { Next::Close },
        })
    }

    async fn redirect(
        &mut self,
        req: &Request,
        code: StatusCode,
        location: &[u8],
    ) -> Result<Answer, LbErr> {
        let loc = HeaderValue::from_bytes(location).map_err(|_| {
            LbErr::new(format!(
                "Invalid redirect location {:?}",
                String::from_utf8_lossy(location)
            ))
        })?;
        let keep = keep_alive(req);
        let head = ResponseHead::new(code)
            .header("Location", loc)
            .header("Content-Length", 0u64);
        self.send(&head.encode(req.version, keep)).await?;
        self.flush().await?;

        Ok(Answer {
            status: code.as_u16(),
            bytes: 0,
            next: if keep { Next::KeepAlive } else { Next::Close },
        })
    }

    /// Programs always get the rest of the connection's input stream to
    /// themselves, so the connection closes afterward.
    async fn gateway(&mut self, req: &Request, host: &HostDir, job: &Job) -> Result<Answer, LbErr> {
        let ctx = Context {
            cfg: self.cfg,
            host,
            req,
            peer: self.peer,
        };
        let outcome = cgi::run(
            &ctx,
            job,
            &mut self.input,
            &mut self.output,
            &mut self.reaper,
        )
        .await?;

        Ok(Answer {
            status: outcome.status,
            bytes: outcome.bytes,
            next: Next::Close,
        })
    }
}
