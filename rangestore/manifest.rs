use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::KeyType;
use crate::storage::StoreType;
use std::fs;
use std::io;
use std::path::Path;

/// Layout an index was written with. Reopening an index with a different
/// layout would route keys to servers that never stored them.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Manifest {
    pub key_type: KeyType,
    pub index_type: String,
    pub store_type: StoreType,
    pub num_servers: u32,
    pub server_factor: u32,
    pub slice_size: u64,
    pub num_nodes: u32,
}

impl Manifest {
    pub fn of(index: &Index) -> Manifest {
        let topology = index.topology();
        Manifest {
            key_type: index.key_type(),
            index_type: index.kind().name().to_string(),
            store_type: index.store_type(),
            num_servers: topology.num_servers(),
            server_factor: topology.factor,
            slice_size: topology.slice_size,
            num_nodes: topology.num_nodes,
        }
    }

    /// Reads the manifest at `path`, `None` if there is none yet.
    pub fn load(path: &Path) -> Result<Option<Manifest>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No manifest at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::Manifest(format!("unreadable manifest {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string(self)
            .map_err(|e| Error::Manifest(format!("unable to encode manifest: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Fails when `current` differs from the stored layout.
    pub fn validate(&self, current: &Manifest) -> Result<()> {
        let mut mismatches = Vec::new();
        if self.key_type != current.key_type {
            mismatches.push(format!(
                "key type {:?} != {:?}",
                self.key_type, current.key_type
            ));
        }
        if self.index_type != current.index_type {
            mismatches.push(format!(
                "index type {} != {}",
                self.index_type, current.index_type
            ));
        }
        if self.store_type != current.store_type {
            mismatches.push(format!(
                "store type {:?} != {:?}",
                self.store_type, current.store_type
            ));
        }
        if self.server_factor != current.server_factor {
            mismatches.push(format!(
                "server factor {} != {}",
                self.server_factor, current.server_factor
            ));
        }
        if self.slice_size != current.slice_size {
            mismatches.push(format!(
                "slice size {} != {}",
                self.slice_size, current.slice_size
            ));
        }
        if self.num_nodes != current.num_nodes {
            mismatches.push(format!(
                "node count {} != {}",
                self.num_nodes, current.num_nodes
            ));
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            for m in &mismatches {
                error!("Manifest mismatch: {}", m);
            }
            Err(Error::Manifest(mismatches.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest() -> Manifest {
        Manifest {
            key_type: KeyType::Int,
            index_type: "primary".to_string(),
            store_type: StoreType::FlatLog,
            num_servers: 2,
            server_factor: 1,
            slice_size: 100,
            num_nodes: 3,
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.manifest");
        assert_eq!(None, Manifest::load(&path).unwrap());

        manifest().save(&path).unwrap();
        assert_eq!(Some(manifest()), Manifest::load(&path).unwrap());
    }

    #[test]
    fn mismatch() {
        assert!(manifest().validate(&manifest()).is_ok());

        let other = Manifest {
            slice_size: 10,
            num_nodes: 4,
            ..manifest()
        };
        match manifest().validate(&other) {
            Err(Error::Manifest(msg)) => {
                assert!(msg.contains("slice size"));
                assert!(msg.contains("node count"));
            }
            res => panic!("unexpected result {:?}", res),
        }
    }
}
