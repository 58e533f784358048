use bytes::{BufMut, Bytes, BytesMut};

use super::RespValue;

pub fn simple_string(bytes: impl AsRef<[u8]>) -> RespValue {
    RespValue::SimpleString(Bytes::copy_from_slice(bytes.as_ref()))
}

pub fn bulk_string(bytes: impl AsRef<[u8]>) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(bytes.as_ref()))
}

pub fn null_bulk_string() -> RespValue {
    RespValue::NullBulkString
}

pub fn array(values: Vec<RespValue>) -> RespValue {
    RespValue::Array(values)
}

/// Array-of-bulk-strings composition used for client replies and for
/// reserializing a command vector during write propagation.
pub fn array_of_bulks<I>(parts: I) -> RespValue
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    RespValue::Array(parts.into_iter().map(bulk_string).collect())
}

impl From<RespValue> for Bytes {
    fn from(value: RespValue) -> Self {
        let mut output = BytesMut::new();
        match value {
            RespValue::SimpleString(bytes) => {
                output.put_u8(b'+');
                output.extend_from_slice(&bytes);
                output.extend_from_slice(b"\r\n");
            }
            RespValue::SimpleError(bytes) => {
                output.put_u8(b'-');
                output.extend_from_slice(&bytes);
                output.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(bytes) => {
                let prefix = format!("${}\r\n", bytes.len());
                output.extend_from_slice(prefix.as_bytes());
                output.extend_from_slice(&bytes);
                output.extend_from_slice(b"\r\n");
            }
            RespValue::NullBulkString => {
                output.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(values) => {
                let prefix = format!("*{}\r\n", values.len());
                output.extend_from_slice(prefix.as_bytes());
                values
                    .into_iter()
                    .map(Bytes::from)
                    .for_each(|bytes| output.extend_from_slice(&bytes));
            }
        }

        output.freeze()
    }
}

pub fn ping() -> Bytes {
    array(vec![bulk_string("PING")]).into()
}

pub fn replconf_listening_port(listening_port: u16) -> Bytes {
    array(vec![
        bulk_string("REPLCONF"),
        bulk_string("listening-port"),
        bulk_string(listening_port.to_string()),
    ])
    .into()
}

pub fn replconf_capa(capability: impl AsRef<[u8]>) -> Bytes {
    array(vec![
        bulk_string("REPLCONF"),
        bulk_string("capa"),
        bulk_string(capability),
    ])
    .into()
}

pub fn psync(replication_id: &str, replication_offset: i64) -> Bytes {
    array(vec![
        bulk_string("PSYNC"),
        bulk_string(replication_id),
        bulk_string(replication_offset.to_string()),
    ])
    .into()
}

pub fn fullresync(replication_id: &str, replication_offset: u64) -> Bytes {
    simple_string(format!("FULLRESYNC {replication_id} {replication_offset}")).into()
}
