use crate::error::{Error, Result};
use crate::key::KeyType;
use crate::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use crate::storage::StoreType;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Configuration of one rank, shared by every rank of the group.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    pub group: GroupConfig,

    #[serde(default)]
    pub store: Options,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct GroupConfig {
    /// Address of every rank, indexed by rank.
    pub ranks: Vec<SocketAddr>,
}

/// Options of the store and of the primary index.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct Options {
    /// Directory holding the database files and manifests.
    pub path: String,
    /// Prefix of the database file names.
    pub name: String,
    pub store_type: StoreType,
    pub key_type: KeyType,
    /// Discard existing database files on open.
    pub create_new: bool,
    /// Append new values to existing values instead of overwriting.
    pub value_append: bool,
    /// Every `server_factor`th rank is a range server.
    pub server_factor: u32,
    pub max_recs_per_slice: u64,
    pub max_servers: u32,
    pub max_message_bytes: usize,
    pub max_bulk_ops: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            path: "./".to_string(),
            name: "rangestore".to_string(),
            store_type: StoreType::FlatLog,
            key_type: KeyType::Int,
            create_new: true,
            value_append: false,
            server_factor: 4,
            max_recs_per_slice: 100_000,
            max_servers: 4096,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_bulk_ops: 1_000_000,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.server_factor == 0 {
            return Err(Error::Config("server_factor must be at least 1".to_string()));
        }
        if self.max_recs_per_slice == 0 {
            return Err(Error::Config(
                "max_recs_per_slice must be at least 1".to_string(),
            ));
        }
        if self.max_servers == 0 {
            return Err(Error::Config("max_servers must be at least 1".to_string()));
        }
        if self.max_bulk_ops == 0 {
            return Err(Error::Config("max_bulk_ops must be at least 1".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Path of a file of this store.
    pub fn file(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.path).join(format!("{}-{}", self.name, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toml;

    #[test]
    fn full_config() {
        let decoded: Config = toml::from_str(
            r#"
        [group]
        ranks = ["127.0.0.1:7000", "127.0.0.1:7001"]

        [store]
        path = "/tmp/db"
        name = "foo"
        store_type = "memory"
        key_type = "string"
        create_new = false
        value_append = true
        server_factor = 1
        max_recs_per_slice = 10
        max_servers = 2
        max_message_bytes = 1000
        max_bulk_ops = 50
    "#,
        )
        .unwrap();

        assert_eq!(
            Config {
                group: GroupConfig {
                    ranks: vec![
                        "127.0.0.1:7000".parse().unwrap(),
                        "127.0.0.1:7001".parse().unwrap()
                    ],
                },
                store: Options {
                    path: "/tmp/db".to_string(),
                    name: "foo".to_string(),
                    store_type: StoreType::Memory,
                    key_type: KeyType::String,
                    create_new: false,
                    value_append: true,
                    server_factor: 1,
                    max_recs_per_slice: 10,
                    max_servers: 2,
                    max_message_bytes: 1000,
                    max_bulk_ops: 50,
                },
            },
            decoded
        )
    }

    #[test]
    fn defaulted_config() {
        let decoded: Config = toml::from_str(
            r#"
        [group]
        ranks = ["127.0.0.1:7000"]

        [store]
        key_type = "long_int"
    "#,
        )
        .unwrap();

        assert_eq!(
            Config {
                group: GroupConfig {
                    ranks: vec!["127.0.0.1:7000".parse().unwrap()],
                },
                store: Options {
                    key_type: KeyType::LongInt,
                    ..Options::default()
                },
            },
            decoded
        );
        assert!(decoded.store.validate().is_ok());
    }

    #[test]
    fn invalid_options() {
        let options = Options {
            server_factor: 0,
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }
}
