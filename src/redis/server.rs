use std::{fmt, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, ToSocketAddrs,
    },
    sync::mpsc,
};

use super::{engine::CommandPacket, resp::reader::RespReader};

/// Opaque per-connection identity. Minted monotonically from 1 by the
/// acceptor; 0 is reserved for the replica's inbound link from its primary,
/// whose writes must apply without replies or onward propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId(u64);

impl ClientId {
    pub const PRIMARY_LINK: ClientId = ClientId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn is_primary_link(&self) -> bool {
        *self == Self::PRIMARY_LINK
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The engine-facing side of a connection actor: its identity plus the
/// outbound queue drained by the actor's writer task. The actor holds the
/// only long-lived `Arc`; the engine and replica set keep `Weak` clones, so
/// a handle dies with its connection.
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    pub fn new(id: ClientId, outbound: mpsc::Sender<Bytes>) -> Self {
        Self { id, outbound }
    }

    /// Builds a handle whose writer task drains the outbound queue into
    /// `write_half` strictly in order: the next fragment is written only
    /// after the previous write completed.
    pub fn for_socket(id: ClientId, mut write_half: OwnedWriteHalf) -> Arc<Self> {
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(32);
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(err) = write_half.write_all(&bytes).await {
                    log::debug!("client {id}: write failed: {err}");
                    break;
                }
            }
        });

        Arc::new(Self::new(id, outbound))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn send(&self, bytes: Bytes) -> anyhow::Result<()> {
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("client {} outbound queue is closed", self.id))
    }
}

/// Accepts TCP peers and runs one connection actor per socket. Accept errors
/// are logged and the loop continues; actor errors never reach this loop.
pub struct RedisServer {
    listener: TcpListener,
    next_client_id: u64,
}

impl RedisServer {
    pub async fn bind(addresses: impl ToSocketAddrs) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addresses).await?;
        Ok(Self {
            listener,
            next_client_id: 1,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self, command_tx: mpsc::Sender<CommandPacket>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, address)) => {
                    let id = ClientId::new(self.next_client_id);
                    self.next_client_id += 1;
                    log::info!("client {id} connected from {address}");

                    let command_tx = command_tx.clone();
                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        let handle = ClientHandle::for_socket(id, write_half);
                        if let Err(err) = process_stream(read_half, handle, command_tx).await {
                            log::error!("client {id}: {err:#}");
                        }

                        log::info!("client {id} disconnected");
                    });
                }
                Err(err) => log::error!("accept failed: {err}"),
            }
        }
    }
}

/// The actor's read loop: frame, convert to a command vector, hand to the
/// engine. Frames that are not arrays of bulk strings, and empty arrays,
/// are skipped without dispatch. A malformed frame is fatal to this
/// connection only.
async fn process_stream(
    read_half: OwnedReadHalf,
    handle: Arc<ClientHandle>,
    command_tx: mpsc::Sender<CommandPacket>,
) -> anyhow::Result<()> {
    let mut reader = RespReader::new(read_half);
    loop {
        let Some(frame) = reader.read_frame().await? else {
            return Ok(());
        };

        let Some(parts) = frame.into_command_parts() else {
            log::debug!("client {}: skipping a non-command frame", handle.id());
            continue;
        };

        if parts.is_empty() {
            continue;
        }

        let packet = CommandPacket {
            client: handle.clone(),
            parts,
        };
        if command_tx.send(packet).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::mpsc,
    };

    use super::RedisServer;
    use crate::redis::{config::Config, engine::Engine, replication::Replication, store::Store};

    async fn start_server() -> std::net::SocketAddr {
        let (command_tx, command_rx) = mpsc::channel(32);
        let engine = Engine::new(
            Arc::new(Store::new()),
            Config::default(),
            Replication::primary(),
        );
        tokio::spawn(engine.run(command_rx));

        let server = RedisServer::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        tokio::spawn(server.run(command_tx));
        address
    }

    async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
        stream.write_all(request).await.unwrap();
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn serves_ping_echo_set_and_get_over_the_wire() {
        let address = start_server().await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        roundtrip(&mut stream, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n").await;
        roundtrip(
            &mut stream,
            b"*2\r\n$4\r\necho\r\n$3\r\nhey\r\n",
            b"+hey\r\n",
        )
        .await;
        roundtrip(
            &mut stream,
            b"*3\r\n$3\r\nset\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"+OK\r\n",
        )
        .await;
        roundtrip(
            &mut stream,
            b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n",
            b"$3\r\nbar\r\n",
        )
        .await;
        roundtrip(
            &mut stream,
            b"*2\r\n$3\r\nget\r\n$3\r\nbaz\r\n",
            b"$-1\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn state_is_shared_across_connections() {
        let address = start_server().await;

        let mut first = TcpStream::connect(address).await.unwrap();
        roundtrip(
            &mut first,
            b"*3\r\n$3\r\nset\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"+OK\r\n",
        )
        .await;

        let mut second = TcpStream::connect(address).await.unwrap();
        roundtrip(
            &mut second,
            b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n",
            b"$3\r\nbar\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn psync_promotes_and_receives_propagated_writes() {
        let address = start_server().await;

        let mut replica = TcpStream::connect(address).await.unwrap();
        replica
            .write_all(b"*3\r\n$5\r\npsync\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();

        // "+FULLRESYNC <40 chars> 0\r\n" followed by the placeholder payload.
        let mut fullresync = vec![0u8; b"+FULLRESYNC ".len() + 40 + b" 0\r\n".len()];
        replica.read_exact(&mut fullresync).await.unwrap();
        assert!(fullresync.starts_with(b"+FULLRESYNC "));
        let mut placeholder = [0u8; 4];
        replica.read_exact(&mut placeholder).await.unwrap();
        assert_eq!(&placeholder, b"$0\r\n");

        let mut client = TcpStream::connect(address).await.unwrap();
        roundtrip(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"+OK\r\n",
        )
        .await;

        let propagated = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let mut received = vec![0u8; propagated.len()];
        replica.read_exact(&mut received).await.unwrap();
        assert_eq!(received, propagated);
    }

    #[tokio::test]
    async fn unknown_commands_leave_the_connection_open() {
        let address = start_server().await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        stream
            .write_all(b"*1\r\n$8\r\nflushall\r\n")
            .await
            .unwrap();
        roundtrip(&mut stream, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n").await;
    }
}
