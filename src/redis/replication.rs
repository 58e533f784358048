use std::{fs, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::timeout,
};

use super::{
    engine::CommandPacket,
    rdb,
    resp::{encoding, reader::RespReader, RespValue},
    server::{ClientHandle, ClientId},
    store::Store,
};

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Replication state: the identity reported by INFO and FULLRESYNC, and the
/// set of promoted replica connections. Replica handles are weak; one that
/// no longer upgrades is pruned at fan-out time.
pub struct Replication {
    role: Role,
    replication_id: String,
    replication_offset: u64,
    replicas: Vec<std::sync::Weak<ClientHandle>>,
}

impl Replication {
    pub fn primary() -> Self {
        Self::with_role(Role::Primary)
    }

    pub fn replica() -> Self {
        Self::with_role(Role::Replica)
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            replication_id: generate_replication_id(),
            replication_offset: 0,
            replicas: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn info(&self) -> String {
        let role = match self.role {
            Role::Primary => "master",
            Role::Replica => "slave",
        };

        format!(
            "# Replication\nrole:{role}\nmaster_replid:{}\nmaster_repl_offset:{}",
            self.replication_id, self.replication_offset
        )
    }

    pub fn fullresync_reply(&self) -> Bytes {
        encoding::fullresync(&self.replication_id, self.replication_offset)
    }

    pub fn register_replica(&mut self, handle: &Arc<ClientHandle>) {
        log::info!("client {} promoted to replica", handle.id());
        self.replicas.push(Arc::downgrade(handle));
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Fans a reserialized write out to every live replica, in commit order.
    /// Handles whose connection is gone are dropped silently.
    pub async fn propagate(&mut self, bytes: Bytes) {
        if self.replicas.is_empty() {
            return;
        }

        let mut live = Vec::with_capacity(self.replicas.len());
        for weak in self.replicas.drain(..) {
            let Some(handle) = weak.upgrade() else {
                continue;
            };

            if let Err(err) = handle.send(bytes.clone()).await {
                log::debug!("dropping replica {}: {err}", handle.id());
                continue;
            }

            live.push(weak);
        }

        self.replicas = live;
    }
}

/// 40 alphanumeric characters from the thread-local generator.
pub fn generate_replication_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    (0..40)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Connects to the primary, walks the handshake, imports the snapshot it
/// sends, and leaves a background task streaming its writes into the engine
/// as the reserved primary-link client. Any failed or unexpected step is
/// fatal to startup.
pub async fn synchronize_with_primary(
    primary_host: &str,
    primary_port: u16,
    listening_port: u16,
    store: Arc<Store>,
    command_tx: mpsc::Sender<CommandPacket>,
) -> anyhow::Result<()> {
    let stream = timeout(
        HANDSHAKE_STEP_TIMEOUT,
        TcpStream::connect((primary_host, primary_port)),
    )
    .await
    .context("timed out connecting to primary")?
    .with_context(|| format!("unable to connect to primary at {primary_host}:{primary_port}"))?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = RespReader::new(read_half);

    expect_simple_reply(&mut reader, &mut write_half, encoding::ping(), b"PONG").await?;
    expect_simple_reply(
        &mut reader,
        &mut write_half,
        encoding::replconf_listening_port(listening_port),
        b"OK",
    )
    .await?;
    expect_simple_reply(
        &mut reader,
        &mut write_half,
        encoding::replconf_capa("psync2"),
        b"OK",
    )
    .await?;

    write_half.write_all(&encoding::psync("?", -1)).await?;
    let reply = timeout(HANDSHAKE_STEP_TIMEOUT, reader.read_frame())
        .await
        .context("timed out waiting for FULLRESYNC from primary")??;
    match reply {
        Some(RespValue::SimpleString(reply)) if reply.starts_with(b"FULLRESYNC") => {}
        other => anyhow::bail!("expected '+FULLRESYNC' from primary but got {other:?}"),
    }

    let payload = timeout(HANDSHAKE_STEP_TIMEOUT, reader.read_rdb_payload())
        .await
        .context("timed out waiting for the snapshot payload")??;
    import_snapshot(&payload, listening_port, &store)?;

    let handle = ClientHandle::for_socket(ClientId::PRIMARY_LINK, write_half);
    tokio::spawn(stream_primary_writes(reader, handle, command_tx));

    Ok(())
}

async fn expect_simple_reply(
    reader: &mut RespReader<OwnedReadHalf>,
    write_half: &mut OwnedWriteHalf,
    request: Bytes,
    expected: &[u8],
) -> anyhow::Result<()> {
    write_half.write_all(&request).await?;
    let reply = timeout(HANDSHAKE_STEP_TIMEOUT, reader.read_frame())
        .await
        .with_context(|| {
            format!(
                "timed out waiting for '+{}' from primary",
                expected.escape_ascii()
            )
        })??;

    match reply {
        Some(RespValue::SimpleString(reply)) if reply == expected => Ok(()),
        other => Err(anyhow::anyhow!(
            "expected '+{}' from primary but got {other:?}",
            expected.escape_ascii()
        )),
    }
}

/// The payload goes through a temp file so the boot-time file decoder is the
/// one importer of snapshot bytes.
fn import_snapshot(payload: &[u8], listening_port: u16, store: &Store) -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("redlite-sync-{listening_port}.rdb"));
    fs::write(&path, payload)
        .with_context(|| format!("unable to spool the snapshot to {}", path.display()))?;

    let entries = rdb::load(&path);
    let _ = fs::remove_file(&path);

    log::info!("imported {} records from the primary's snapshot", entries.len());
    for entry in entries {
        store.set_raw(entry.key, entry.value, entry.expires_at);
    }

    Ok(())
}

/// After the snapshot the primary streams plain command frames. They enter
/// the engine as the reserved primary-link client, which both applies them
/// and keeps them from being replied to or propagated onward.
async fn stream_primary_writes(
    mut reader: RespReader<OwnedReadHalf>,
    handle: Arc<ClientHandle>,
    command_tx: mpsc::Sender<CommandPacket>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                let Some(parts) = frame.into_command_parts() else {
                    log::debug!("ignoring a non-command frame on the replication link");
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
                    break;
                }
            }
            Ok(None) => {
                log::info!("primary closed the replication link");
                break;
            }
            Err(err) => {
                log::error!("replication link failed: {err:#}");
                break;
            }
        }
    }
}
