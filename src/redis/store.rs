use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use bytes::Bytes;

use super::glob;

/// One stored value: the payload plus an optional absolute wall-clock expiry.
#[derive(Debug, Clone)]
pub struct Record {
    data: Bytes,
    expires_at: Option<SystemTime>,
}

impl Record {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= SystemTime::now(),
            None => false,
        }
    }
}

/// The key/value map shared by every connection actor and the replica's
/// inbound path. Expired records are logically absent and are purged the
/// next time the key is read (lazy expiry); `get` never returns expired
/// data. The lock is never held across a suspension point.
#[derive(Debug, Default)]
pub struct Store {
    records: Mutex<HashMap<Bytes, Record>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut records = self.records();
        match records.get(key) {
            Some(record) if record.expired() => {
                records.remove(key);
                None
            }
            Some(record) => Some(record.data.clone()),
            None => None,
        }
    }

    /// Installs a record, replacing any prior one. `expiry_ms` is relative
    /// to the current wall-clock time.
    pub fn set(&self, key: Bytes, value: Bytes, expiry_ms: Option<u64>) {
        let expires_at = expiry_ms.map(|ms| SystemTime::now() + Duration::from_millis(ms));
        self.set_raw(key, value, expires_at);
    }

    /// Installs a record with an absolute expiry, which may already be in
    /// the past. Used by the snapshot loader.
    pub fn set_raw(&self, key: Bytes, value: Bytes, expires_at: Option<SystemTime>) {
        self.records().insert(
            key,
            Record {
                data: value,
                expires_at,
            },
        );
    }

    /// Keys matching a glob pattern. Expired records are purged wholesale
    /// first so a pattern read never observes them either.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let mut records = self.records();
        records.retain(|_, record| !record.expired());
        records
            .keys()
            .filter(|key| glob::matches(pattern, key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Bytes, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
