//! Equipment catalog: which equipment exists, whether it can be booked, and how
//! many interchangeable units it has. The engine only reads it.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EquipmentInfo {
    pub id: Ulid,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_active() -> bool {
    true
}

fn default_quantity() -> u32 {
    1
}

impl EquipmentInfo {
    pub fn new(id: Ulid, quantity: u32) -> Self {
        Self {
            id,
            is_active: true,
            quantity,
        }
    }

    pub fn is_reservable(&self) -> bool {
        self.is_active && self.quantity > 0
    }
}

#[async_trait]
pub trait EquipmentCatalog: Send + Sync {
    async fn lookup(&self, equipment_id: Ulid) -> Option<EquipmentInfo>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Catalog held in memory, loaded from a JSON array of [`EquipmentInfo`].
#[derive(Default)]
pub struct StaticCatalog {
    entries: DashMap<Ulid, EquipmentInfo>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = EquipmentInfo>) -> Self {
        let catalog = Self::new();
        for info in entries {
            catalog.upsert(info);
        }
        catalog
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let entries: Vec<EquipmentInfo> = serde_json::from_str(raw)?;
        Ok(Self::from_entries(entries))
    }

    pub fn upsert(&self, info: EquipmentInfo) {
        self.entries.insert(info.id, info);
    }

    /// Returns false if the id is unknown.
    pub fn set_active(&self, id: Ulid, active: bool) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut e) => {
                e.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EquipmentCatalog for StaticCatalog {
    async fn lookup(&self, equipment_id: Ulid) -> Option<EquipmentInfo> {
        self.entries.get(&equipment_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() {
        let id = Ulid::new();
        let raw = format!(r#"[{{"id":"{id}"}}, {{"id":"{}","is_active":false,"quantity":3}}]"#, Ulid::new());
        let catalog = StaticCatalog::from_json(&raw).unwrap();
        assert_eq!(catalog.len(), 2);
        let info = catalog.entries.get(&id).unwrap().clone();
        assert!(info.is_active);
        assert_eq!(info.quantity, 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = format!(r#"[{{"id":"{}","colour":"red"}}]"#, Ulid::new());
        assert!(matches!(StaticCatalog::from_json(&raw), Err(CatalogError::Parse(_))));
    }

    #[tokio::test]
    async fn lookup_reflects_updates() {
        let id = Ulid::new();
        let catalog = StaticCatalog::from_entries([EquipmentInfo::new(id, 2)]);
        assert!(catalog.lookup(id).await.unwrap().is_reservable());

        assert!(catalog.set_active(id, false));
        assert!(!catalog.lookup(id).await.unwrap().is_reservable());
        assert!(!catalog.set_active(Ulid::new(), false));
        assert!(catalog.lookup(Ulid::new()).await.is_none());
    }

    #[test]
    fn zero_quantity_is_not_reservable() {
        assert!(!EquipmentInfo::new(Ulid::new(), 0).is_reservable());
    }
}
