pub mod encoding;
pub mod reader;

use bytes::Bytes;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RespValue {
    SimpleString(Bytes),
    SimpleError(Bytes),
    BulkString(Bytes),
    NullBulkString,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        if let RespValue::Array(values) = self {
            Some(values)
        } else {
            None
        }
    }

    pub fn into_bulk_string(self) -> Option<Bytes> {
        if let RespValue::BulkString(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// A command frame is an array whose elements are all bulk strings;
    /// anything else yields `None`.
    pub fn into_command_parts(self) -> Option<Vec<Bytes>> {
        let values = self.into_array()?;
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            parts.push(value.into_bulk_string()?);
        }

        Some(parts)
    }
}
