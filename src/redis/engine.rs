use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    command::{CommandError, RedisCommand},
    config::Config,
    replication::Replication,
    resp::{encoding, RespValue},
    server::ClientHandle,
    store::Store,
};

/// One decoded command frame on its way to the engine, together with the
/// handle of the connection that produced it.
pub struct CommandPacket {
    pub client: Arc<ClientHandle>,
    pub parts: Vec<Bytes>,
}

/// The command engine: a single task that owns all command execution.
/// Connection actors feed it decoded command vectors over a channel; it
/// mutates the store, queues reply fragments on the issuing actor's outbound
/// queue, and hands successful writes to the replication controller.
pub struct Engine {
    store: Arc<Store>,
    config: Config,
    replication: Replication,
}

impl Engine {
    pub fn new(store: Arc<Store>, config: Config, replication: Replication) -> Self {
        Self {
            store,
            config,
            replication,
        }
    }

    pub async fn run(mut self, mut command_rx: mpsc::Receiver<CommandPacket>) {
        while let Some(packet) = command_rx.recv().await {
            self.dispatch(packet).await;
        }
    }

    async fn dispatch(&mut self, packet: CommandPacket) {
        let CommandPacket { client, parts } = packet;
        let command = match RedisCommand::parse(&parts) {
            Ok(command) => command,
            Err(CommandError::Unknown(name)) => {
                // Unknown commands elicit no reply; the connection lives on.
                log::debug!("client {}: ignoring unknown command '{name}'", client.id());
                return;
            }
            Err(err @ CommandError::Arity(_)) => {
                log::debug!("client {}: {err}", client.id());
                if !client.id().is_primary_link() {
                    self.send_fragments(&client, vec![Bytes::from_static(b"$-1\r\n")])
                        .await;
                }
                return;
            }
        };

        log::debug!("client {}: {command:?}", client.id());
        let mut fragments = Vec::with_capacity(1);
        match command {
            RedisCommand::Ping => fragments.push(Bytes::from_static(b"+PONG\r\n")),
            RedisCommand::Echo { message } => {
                fragments.push(RespValue::SimpleString(message).into());
            }
            RedisCommand::Get { key } => {
                let reply = match self.store.get(&key) {
                    Some(value) => RespValue::BulkString(value),
                    None => RespValue::NullBulkString,
                };
                fragments.push(reply.into());
            }
            RedisCommand::Set {
                key,
                value,
                expiry_ms,
            } => {
                self.store.set(key, value, expiry_ms);

                // Writes arriving over the primary link are applied silently:
                // no reply, and no propagation back toward the primary.
                if client.id().is_primary_link() {
                    return;
                }

                fragments.push(Bytes::from_static(b"+OK\r\n"));
                let reserialized = encoding::array_of_bulks(&parts);
                self.replication.propagate(reserialized.into()).await;
            }
            RedisCommand::Keys { pattern } => {
                let keys = self
                    .store
                    .keys(&pattern)
                    .into_iter()
                    .map(RespValue::BulkString)
                    .collect();
                fragments.push(RespValue::Array(keys).into());
            }
            RedisCommand::ConfigGet { name } => {
                let value = self.config.lookup(&name);
                let reply = encoding::array(vec![
                    RespValue::BulkString(name),
                    encoding::bulk_string(value),
                ]);
                fragments.push(reply.into());
            }
            RedisCommand::Info { .. } => {
                fragments.push(encoding::bulk_string(self.replication.info()).into());
            }
            RedisCommand::ReplConf => fragments.push(Bytes::from_static(b"+OK\r\n")),
            RedisCommand::PSync => {
                fragments.push(self.replication.fullresync_reply());
                fragments.push(Bytes::from_static(b"$0\r\n"));
                self.replication.register_replica(&client);
            }
        }

        if client.id().is_primary_link() {
            return;
        }

        self.send_fragments(&client, fragments).await;
    }

    async fn send_fragments(&self, client: &Arc<ClientHandle>, fragments: Vec<Bytes>) {
        for fragment in fragments {
            if let Err(err) = client.send(fragment).await {
                log::debug!("client {}: {err}", client.id());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{CommandPacket, Engine};
    use crate::redis::{
        config::Config,
        replication::Replication,
        server::{ClientHandle, ClientId},
        store::Store,
    };

    fn engine() -> Engine {
        Engine::new(
            Arc::new(Store::new()),
            Config::default(),
            Replication::primary(),
        )
    }

    fn client(id: u64) -> (Arc<ClientHandle>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(32);
        (Arc::new(ClientHandle::new(ClientId::new(id), tx)), rx)
    }

    async fn dispatch(engine: &mut Engine, client: &Arc<ClientHandle>, tokens: &[&str]) {
        let parts = tokens
            .iter()
            .map(|token| Bytes::copy_from_slice(token.as_bytes()))
            .collect();
        engine
            .dispatch(CommandPacket {
                client: client.clone(),
                parts,
            })
            .await;
    }

    #[tokio::test]
    async fn ping_and_command_reply_pong() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["ping"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+PONG\r\n");

        dispatch(&mut engine, &client, &["COMMAND"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+PONG\r\n");
    }

    #[tokio::test]
    async fn echo_replies_a_simple_string() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["echo", "hey"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+hey\r\n");
    }

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["set", "foo", "bar"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+OK\r\n");

        dispatch(&mut engine, &client, &["get", "foo"]).await;
        assert_eq!(rx.recv().await.unwrap(), "$3\r\nbar\r\n");

        dispatch(&mut engine, &client, &["get", "baz"]).await;
        assert_eq!(rx.recv().await.unwrap(), "$-1\r\n");
    }

    #[tokio::test]
    async fn set_with_px_expires() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["set", "foo", "bar", "px", "10"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+OK\r\n");

        tokio::time::sleep(Duration::from_millis(30)).await;
        dispatch(&mut engine, &client, &["get", "foo"]).await;
        assert_eq!(rx.recv().await.unwrap(), "$-1\r\n");
    }

    #[tokio::test]
    async fn keys_replies_an_array_of_matches() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["set", "foo", "1"]).await;
        rx.recv().await.unwrap();

        dispatch(&mut engine, &client, &["keys", "*"]).await;
        assert_eq!(rx.recv().await.unwrap(), "*1\r\n$3\r\nfoo\r\n");

        dispatch(&mut engine, &client, &["keys", "nope*"]).await;
        assert_eq!(rx.recv().await.unwrap(), "*0\r\n");
    }

    #[tokio::test]
    async fn config_get_replies_name_value_pairs() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["config", "get", "dbfilename"]).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            "*2\r\n$10\r\ndbfilename\r\n$8\r\ndump.rdb\r\n"
        );

        dispatch(&mut engine, &client, &["config", "get", "maxmemory"]).await;
        assert_eq!(rx.recv().await.unwrap(), "*2\r\n$9\r\nmaxmemory\r\n$0\r\n\r\n");
    }

    #[tokio::test]
    async fn info_reports_the_replication_role() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["info", "replication"]).await;
        let reply = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text.contains("role:master"));
        assert!(text.contains("master_replid:"));

        let mut replica_engine = Engine::new(
            Arc::new(Store::new()),
            Config::default(),
            Replication::replica(),
        );
        dispatch(&mut replica_engine, &client, &["info"]).await;
        let reply = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&reply).contains("role:slave"));
    }

    #[tokio::test]
    async fn replconf_is_accepted_as_advisory() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["replconf", "listening-port", "6380"]).await;
        assert_eq!(rx.recv().await.unwrap(), "+OK\r\n");
    }

    #[tokio::test]
    async fn psync_replies_two_contiguous_fragments_and_promotes() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["psync", "?", "-1"]).await;
        let first = rx.recv().await.unwrap();
        assert!(first.starts_with(b"+FULLRESYNC "));
        assert_eq!(rx.recv().await.unwrap(), "$0\r\n");
        assert_eq!(engine.replication.replica_count(), 1);
    }

    #[tokio::test]
    async fn arity_violations_reply_null_bulk() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["set", "foo"]).await;
        assert_eq!(rx.recv().await.unwrap(), "$-1\r\n");

        dispatch(&mut engine, &client, &["echo"]).await;
        assert_eq!(rx.recv().await.unwrap(), "$-1\r\n");
    }

    #[tokio::test]
    async fn unknown_commands_are_silent() {
        let mut engine = engine();
        let (client, mut rx) = client(1);

        dispatch(&mut engine, &client, &["flushall"]).await;
        dispatch(&mut engine, &client, &["ping"]).await;
        // The next reply is PONG: nothing was queued for the unknown command.
        assert_eq!(rx.recv().await.unwrap(), "+PONG\r\n");
    }

    #[tokio::test]
    async fn writes_fan_out_to_promoted_replicas() {
        let mut engine = engine();
        let (replica, mut replica_rx) = client(2);
        let (client, mut client_rx) = client(1);

        dispatch(&mut engine, &replica, &["psync", "?", "-1"]).await;
        replica_rx.recv().await.unwrap();
        replica_rx.recv().await.unwrap();

        dispatch(&mut engine, &client, &["set", "foo", "bar"]).await;
        assert_eq!(client_rx.recv().await.unwrap(), "+OK\r\n");
        assert_eq!(
            replica_rx.recv().await.unwrap(),
            "*3\r\n$3\r\nset\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"
        );

        // Reads are not propagated.
        dispatch(&mut engine, &client, &["get", "foo"]).await;
        client_rx.recv().await.unwrap();
        assert!(replica_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn primary_link_writes_apply_silently() {
        let mut engine = engine();
        let (replica, mut replica_rx) = client(2);
        dispatch(&mut engine, &replica, &["psync", "?", "-1"]).await;
        replica_rx.recv().await.unwrap();
        replica_rx.recv().await.unwrap();

        let (link, mut link_rx) = client(0);
        assert!(link.id().is_primary_link());
        dispatch(&mut engine, &link, &["set", "foo", "bar"]).await;

        assert_eq!(engine.store.get(b"foo"), Some(Bytes::from_static(b"bar")));
        assert!(link_rx.try_recv().is_err());
        assert!(replica_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_prunes_lapsed_replicas() {
        let mut engine = engine();
        let (replica, mut replica_rx) = client(2);
        let (client, mut client_rx) = client(1);

        dispatch(&mut engine, &replica, &["psync", "?", "-1"]).await;
        replica_rx.recv().await.unwrap();
        replica_rx.recv().await.unwrap();

        drop(replica);
        drop(replica_rx);

        dispatch(&mut engine, &client, &["set", "foo", "bar"]).await;
        assert_eq!(client_rx.recv().await.unwrap(), "+OK\r\n");
        assert_eq!(engine.replication.replica_count(), 0);
    }
}
