//! textsync server binary.
//!
//! ```text
//! textsync-server [--bind ADDR] [--history N] [--max-age N]
//! ```
//!
//! Logging goes through `env_logger`; set `RUST_LOG=textsync=debug` for
//! per-operation traces.

use textsync::{CollabServer, ServerConfig};

fn usage() -> ! {
    eprintln!("usage: textsync-server [--bind ADDR] [--history N] [--max-age N]");
    std::process::exit(2);
}

fn parse_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |what: &str| match args.next() {
            Some(v) => v,
            None => {
                eprintln!("{what} requires a value");
                usage();
            }
        };
        match arg.as_str() {
            "--bind" => config.bind_addr = value("--bind"),
            "--history" => match value("--history").parse() {
                Ok(n) => config.model.num_cached_ops = n,
                Err(_) => usage(),
            },
            "--max-age" => match value("--max-age").parse() {
                Ok(n) => config.model.maximum_age = n,
                Err(_) => usage(),
            },
            "--help" | "-h" => usage(),
            _ => {
                eprintln!("unknown argument: {arg}");
                usage();
            }
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = parse_args();
    log::info!(
        "starting with history={} max-age={}",
        config.model.num_cached_ops,
        config.model.maximum_age
    );
    let server = CollabServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("server failed: {e}");
        std::process::exit(1);
    }
}
