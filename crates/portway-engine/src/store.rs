//! Durable storage for tunnel definitions
//!
//! One JSON document per definition under `<data_dir>/tunnels/`. Every
//! mutation is written to a temp file and renamed into place, so a definition
//! acknowledged to a client survives an engine crash. Runtime status is never
//! written here.

use crate::definition::{validate_id, TunnelDefinition};
use crate::error::EngineError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Filesystem-backed definition store
#[derive(Debug)]
pub struct TunnelStore {
    base_dir: PathBuf,
}

impl TunnelStore {
    /// Open (creating if needed) a store rooted at `base_dir`
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| {
            EngineError::Storage(format!(
                "failed to create definition directory {:?}: {}",
                base_dir, e
            ))
        })?;
        Ok(Self { base_dir })
    }

    /// Default store location: `~/.portway/tunnels`
    pub fn default_dir() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Storage("failed to resolve home directory".to_string()))?;
        Ok(home.join(".portway").join("tunnels"))
    }

    fn definition_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    /// Persist a definition, overwriting any previous version
    pub fn save(&self, def: &TunnelDefinition) -> Result<(), EngineError> {
        validate_id(&def.id)?;

        let path = self.definition_path(&def.id);
        let json = serde_json::to_string_pretty(def)
            .map_err(|e| EngineError::Storage(format!("failed to serialize definition: {}", e)))?;

        // Write-then-rename keeps a crash from leaving a torn file behind.
        let tmp = self.base_dir.join(format!(".{}.json.tmp", def.id));
        fs::write(&tmp, json).map_err(|e| {
            EngineError::Storage(format!("failed to write definition file {:?}: {}", tmp, e))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            EngineError::Storage(format!("failed to commit definition file {:?}: {}", path, e))
        })?;

        Ok(())
    }

    /// Load one definition by id
    pub fn load(&self, id: &str) -> Result<TunnelDefinition, EngineError> {
        validate_id(id)?;

        let path = self.definition_path(id);
        if !path.exists() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let json = fs::read_to_string(&path).map_err(|e| {
            EngineError::Storage(format!("failed to read definition file {:?}: {}", path, e))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            EngineError::Storage(format!("failed to parse definition file {:?}: {}", path, e))
        })
    }

    /// Load every definition in the store, skipping files that fail to parse
    /// so one corrupt entry cannot keep the engine from starting.
    pub fn load_all(&self) -> Result<Vec<TunnelDefinition>, EngineError> {
        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            EngineError::Storage(format!(
                "failed to read definition directory {:?}: {}",
                self.base_dir, e
            ))
        })?;

        let mut definitions = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| EngineError::Storage(format!("failed to enumerate store: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()))
            {
                Ok(def) => definitions.push(def),
                Err(e) => warn!("Skipping unreadable definition file {:?}: {}", path, e),
            }
        }

        definitions.sort_by(|a: &TunnelDefinition, b: &TunnelDefinition| a.id.cmp(&b.id));
        Ok(definitions)
    }

    /// Check whether a definition exists
    pub fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.definition_path(id).exists()
    }

    /// Remove a definition
    pub fn remove(&self, id: &str) -> Result<(), EngineError> {
        validate_id(id)?;

        let path = self.definition_path(id);
        if !path.exists() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        fs::remove_file(&path).map_err(|e| {
            EngineError::Storage(format!("failed to remove definition file {:?}: {}", path, e))
        })
    }

    /// Store directory (for display purposes)
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ForwardDirection, RemoteHost};
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (TunnelStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = TunnelStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn create_test_definition(id: &str) -> TunnelDefinition {
        TunnelDefinition {
            id: id.to_string(),
            name: Some(format!("{} tunnel", id)),
            description: None,
            remote: RemoteHost {
                host: "bastion.example.net".to_string(),
                ssh_port: 22,
                username: "deploy".to_string(),
                credential_ref: "deploy-key".to_string(),
            },
            bind_addr: "127.0.0.1".to_string(),
            local_port: 8022,
            remote_port: 5432,
            direction: ForwardDirection::LocalToRemote,
            enabled: true,
            keep_alive_interval_secs: 30,
            max_backoff_secs: 60,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        let def = create_test_definition("pg-prod");

        store.save(&def).unwrap();
        let loaded = store.load("pg-prod").unwrap();

        assert_eq!(loaded, def);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (store, _temp) = create_test_store();
        let err = store.load("ghost").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_save_rejects_bad_id() {
        let (store, _temp) = create_test_store();
        let mut def = create_test_definition("ok");
        def.id = "../escape".to_string();
        assert!(matches!(
            store.save(&def),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_load_all_sorted_and_skips_corrupt() {
        let (store, temp) = create_test_store();
        store.save(&create_test_definition("beta")).unwrap();
        store.save(&create_test_definition("alpha")).unwrap();
        fs::write(temp.path().join("broken.json"), "{not json").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let defs = store.load_all().unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].id, "alpha");
        assert_eq!(defs[1].id, "beta");
    }

    #[test]
    fn test_remove() {
        let (store, _temp) = create_test_store();
        store.save(&create_test_definition("gone")).unwrap();

        assert!(store.exists("gone"));
        store.remove("gone").unwrap();
        assert!(!store.exists("gone"));
        assert!(matches!(
            store.remove("gone"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let (store, temp) = create_test_store();
        let mut def = create_test_definition("pg-prod");
        store.save(&def).unwrap();

        def.local_port = 9022;
        store.save(&def).unwrap();

        let loaded = store.load("pg-prod").unwrap();
        assert_eq!(loaded.local_port, 9022);
        // No temp droppings left behind
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
