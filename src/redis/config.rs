use std::path::PathBuf;

/// Name-indexed registry of string-valued server configuration, as surfaced
/// by `CONFIG GET`.
#[derive(Debug, Clone)]
pub struct Config {
    dir: String,
    dbfilename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: "/tmp/redis-data".to_string(),
            dbfilename: "dump.rdb".to_string(),
        }
    }
}

impl Config {
    /// Unknown names resolve to the empty string rather than an error.
    pub fn lookup(&self, name: &[u8]) -> &str {
        match name {
            b"dir" => &self.dir,
            b"dbfilename" => &self.dbfilename,
            _ => "",
        }
    }

    pub fn rdb_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn resolves_known_fields() {
        let config = Config::default();
        assert_eq!(config.lookup(b"dir"), "/tmp/redis-data");
        assert_eq!(config.lookup(b"dbfilename"), "dump.rdb");
    }

    #[test]
    fn unknown_fields_resolve_to_empty() {
        let config = Config::default();
        assert_eq!(config.lookup(b"maxmemory"), "");
    }

    #[test]
    fn joins_the_snapshot_path() {
        let config = Config::default();
        assert_eq!(
            config.rdb_path().to_string_lossy(),
            "/tmp/redis-data/dump.rdb"
        );
    }
}
