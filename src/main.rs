use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use crate::redis::{
    config::Config,
    engine::Engine,
    rdb,
    replication::{self, Replication},
    server::RedisServer,
    store::Store,
};

mod redis;

#[derive(Parser, Debug)]
#[command(
    name = "redlite",
    version,
    about = "Minimal Redis-compatible in-memory key/value server"
)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Replicate from a primary, given as "<host> <port>"
    #[arg(short = 'r', long, value_name = "HOST PORT")]
    replicaof: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,
}

fn parse_primary(replicaof: &str) -> anyhow::Result<(String, u16)> {
    let mut tokens = replicaof.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(host), Some(port), None) => {
            let port = port
                .parse()
                .with_context(|| format!("'{port}' is not a valid primary port"))?;
            Ok((host.to_string(), port))
        }
        _ => anyhow::bail!("--replicaof expects \"<host> <port>\""),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = env_logger::Env::default()
        .default_filter_or(if args.debug { "debug" } else { "info" });
    env_logger::Builder::from_env(env).init();

    let primary = args.replicaof.as_deref().map(parse_primary).transpose()?;

    let config = Config::default();
    let store = Arc::new(Store::new());
    let entries = rdb::load(&config.rdb_path());
    if !entries.is_empty() {
        log::info!(
            "seeded {} records from {}",
            entries.len(),
            config.rdb_path().display()
        );
    }
    for entry in entries {
        store.set_raw(entry.key, entry.value, entry.expires_at);
    }

    let (command_tx, command_rx) = mpsc::channel(32);
    let replication = match &primary {
        Some((host, port)) => {
            replication::synchronize_with_primary(
                host,
                *port,
                args.port,
                store.clone(),
                command_tx.clone(),
            )
            .await
            .context("replication handshake with the primary failed")?;
            Replication::replica()
        }
        None => Replication::primary(),
    };

    let role = replication.role();
    let engine = Engine::new(store, config, replication);
    tokio::spawn(engine.run(command_rx));

    let server = RedisServer::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("unable to listen on port {}", args.port))?;
    log::info!("listening on 127.0.0.1:{} as {role:?}", args.port);
    server.run(command_tx).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_primary;

    #[test]
    fn parses_replicaof_host_and_port() {
        assert_eq!(
            parse_primary("localhost 6379").unwrap(),
            ("localhost".to_string(), 6379)
        );
    }

    #[test]
    fn rejects_malformed_replicaof() {
        assert!(parse_primary("localhost").is_err());
        assert!(parse_primary("localhost sixthousand").is_err());
        assert!(parse_primary("localhost 6379 extra").is_err());
    }
}
