use std::{error::Error, path::PathBuf, str::FromStr};

use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use tokio::io::BufReader;

use lugburz::{
    cfg::Cfg,
    client::{adopt_stdin_socket, stdin_is_socket, Peer},
    serve_connection,
};

/// Log level: `error`, `warn`, `info`, `debug`, `trace`, or `off`.
const LOG_VAR: &str = "LUGBURZ_LOG";
/// Config file used when none is named on the command line.
const CONFIG_VAR: &str = "LUGBURZ_CONFIG";

fn init_logging() {
    let level = std::env::var(LOG_VAR)
        .ok()
        .and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Info);
    // Stdout belongs to the client.
    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("lugburz")
        .build();
    if TermLogger::init(level, log_cfg.clone(), TerminalMode::Stderr, ColorChoice::Never).is_err() {
        let _ = WriteLogger::init(level, log_cfg, std::io::stderr());
    }
}

fn load_cfg() -> Result<Cfg, String> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_VAR))
        .map(PathBuf::from);
    match path {
        Some(path) => Cfg::load(path),
        None => Cfg::defaults(),
    }
}

async fn wrapped_main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let cfg = load_cfg()?;
    log::debug!("Configuration:\n{:#?}", &cfg);

    let mut peer = Peer::from_env();

    let res = if stdin_is_socket() {
        let sock = adopt_stdin_socket()?;
        peer.fill_from_socket(&sock);
        let (rd, wr) = sock.into_split();
        serve_connection(&cfg, &peer, BufReader::new(rd), wr).await
    } else {
        serve_connection(
            &cfg,
            &peer,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
        .await
    };
    // The client may well be gone by now.
    if let Err(e) = res {
        log::debug!("Error closing connection: {}", &e);
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match wrapped_main().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", &e);
            1
        }
    };
    log::logger().flush();
    // Returning would wait on a stdin read the runtime can't cancel.
    std::process::exit(code);
}
