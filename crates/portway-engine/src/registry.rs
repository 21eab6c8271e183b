//! Tunnel registry: authoritative desired state plus published runtime status
//!
//! Mutations hit the store before touching memory, so a storage failure
//! leaves the registry exactly as it was and the command fails cleanly.
//! Supervisors publish status through [`Registry::update_status`] for their
//! own id only; everything else reads.

use crate::definition::{TunnelDefinition, TunnelPatch};
use crate::error::EngineError;
use crate::status::{TunnelRecord, TunnelRuntimeStatus};
use crate::store::TunnelStore;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Entry {
    definition: TunnelDefinition,
    status: TunnelRuntimeStatus,
}

/// Shared registry, cheap to hand to supervisors behind an `Arc`
pub struct Registry {
    store: TunnelStore,
    inner: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    /// Build a registry from whatever the store already holds
    pub fn load(store: TunnelStore) -> Result<Self, EngineError> {
        let mut map = HashMap::new();
        for definition in store.load_all()? {
            map.insert(
                definition.id.clone(),
                Entry {
                    definition,
                    status: TunnelRuntimeStatus::default(),
                },
            );
        }
        Ok(Self {
            store,
            inner: RwLock::new(map),
        })
    }

    /// Add a new definition. Rejects duplicate ids and, for enabled
    /// definitions, local endpoints already claimed by another enabled tunnel.
    pub async fn add(&self, definition: TunnelDefinition) -> Result<TunnelRecord, EngineError> {
        definition.validate()?;

        let mut map = self.inner.write().await;
        if map.contains_key(&definition.id) {
            return Err(EngineError::DuplicateId(definition.id));
        }
        if definition.enabled {
            Self::check_port_free(&map, &definition)?;
        }

        self.store.save(&definition)?;

        let status = TunnelRuntimeStatus::default();
        let record = TunnelRecord {
            definition: definition.clone(),
            status: status.clone(),
        };
        map.insert(definition.id.clone(), Entry { definition, status });
        Ok(record)
    }

    /// Apply a patch and return the updated definition
    pub async fn update(
        &self,
        id: &str,
        patch: &TunnelPatch,
    ) -> Result<TunnelDefinition, EngineError> {
        let mut map = self.inner.write().await;
        let entry = map
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let mut updated = entry.definition.clone();
        patch.apply_to(&mut updated);
        updated.validate()?;
        if updated.enabled {
            Self::check_port_free(&map, &updated)?;
        }

        self.store.save(&updated)?;

        if let Some(entry) = map.get_mut(id) {
            entry.definition = updated.clone();
        }
        Ok(updated)
    }

    /// Flip the enabled flag. Idempotent: a no-change call skips the store
    /// write. Enabling re-checks the local endpoint claim.
    pub async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<TunnelDefinition, EngineError> {
        let mut map = self.inner.write().await;
        let entry = map
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if entry.definition.enabled == enabled {
            return Ok(entry.definition.clone());
        }

        let mut updated = entry.definition.clone();
        updated.enabled = enabled;
        if enabled {
            Self::check_port_free(&map, &updated)?;
        }

        self.store.save(&updated)?;

        if let Some(entry) = map.get_mut(id) {
            entry.definition = updated.clone();
        }
        Ok(updated)
    }

    /// Remove a definition and its status record
    pub async fn remove(&self, id: &str) -> Result<TunnelDefinition, EngineError> {
        let mut map = self.inner.write().await;
        if !map.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }

        self.store.remove(id)?;

        // Checked above; the map cannot have lost it while we held the lock.
        match map.remove(id) {
            Some(entry) => Ok(entry.definition),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<TunnelRecord, EngineError> {
        let map = self.inner.read().await;
        map.get(id)
            .map(|entry| TunnelRecord {
                definition: entry.definition.clone(),
                status: entry.status.clone(),
            })
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// All records, ordered by creation time (id as tiebreak)
    pub async fn list(&self) -> Vec<TunnelRecord> {
        let map = self.inner.read().await;
        let mut records: Vec<TunnelRecord> = map
            .values()
            .map(|entry| TunnelRecord {
                definition: entry.definition.clone(),
                status: entry.status.clone(),
            })
            .collect();
        records.sort_by(|a, b| {
            a.definition
                .created_at
                .cmp(&b.definition.created_at)
                .then_with(|| a.definition.id.cmp(&b.definition.id))
        });
        records
    }

    /// Mutate the published status of one tunnel. A missing id is ignored;
    /// a supervisor may race a delete while winding down.
    pub async fn update_status<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut TunnelRuntimeStatus),
    {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(id) {
            f(&mut entry.status);
        }
    }

    fn check_port_free(
        map: &HashMap<String, Entry>,
        candidate: &TunnelDefinition,
    ) -> Result<(), EngineError> {
        for (id, entry) in map.iter() {
            if id == &candidate.id {
                continue;
            }
            let other = &entry.definition;
            if other.enabled
                && other.bind_addr == candidate.bind_addr
                && other.local_port == candidate.local_port
            {
                return Err(EngineError::PortConflict {
                    bind_addr: candidate.bind_addr.clone(),
                    port: candidate.local_port,
                    existing: id.clone(),
                });
            }
        }
        Ok(())
    }
}
