//! Per-namespace interface tables.

use std::collections::HashMap;
use std::sync::Weak;

use super::registry::Namespace;

/// Identifier of a dataplane-side interface object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DataplaneId(pub u32);

/// A kernel interface as seen in one namespace.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Kernel interface index, stable for the interface's lifetime.
    pub index: u32,
    /// Current name.
    pub name: String,
    /// Owning namespace.
    pub namespace: Weak<Namespace>,
    /// Bound dataplane interface, if the dataplane claimed this name.
    pub dataplane: Option<DataplaneId>,
}

/// Result of applying a new-link record.
#[derive(Debug, Clone)]
pub enum LinkUpdate {
    /// First time this index was seen.
    Added(Interface),
    /// Same index, new name.
    Renamed { interface: Interface, old: String },
    /// Nothing identity-related changed.
    Unchanged(Interface),
}

/// Interfaces of one namespace, keyed by index and by name.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    by_index: HashMap<u32, Interface>,
    by_name: HashMap<String, u32>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a new-link record for `index` carrying `name`.
    pub fn upsert(&mut self, index: u32, name: &str, namespace: Weak<Namespace>) -> LinkUpdate {
        if let Some(existing) = self.by_index.get_mut(&index) {
            if existing.name == name {
                return LinkUpdate::Unchanged(existing.clone());
            }
            let old = std::mem::replace(&mut existing.name, name.to_string());
            let interface = existing.clone();
            if self.by_name.get(&old) == Some(&index) {
                self.by_name.remove(&old);
            }
            self.evict_name(name, index);
            self.by_name.insert(name.to_string(), index);
            return LinkUpdate::Renamed { interface, old };
        }

        self.evict_name(name, index);
        let interface = Interface {
            index,
            name: name.to_string(),
            namespace,
            dataplane: None,
        };
        self.by_index.insert(index, interface.clone());
        self.by_name.insert(name.to_string(), index);
        LinkUpdate::Added(interface)
    }

    // A name held by a different index belongs to an interface whose
    // delete we never saw.
    fn evict_name(&mut self, name: &str, index: u32) {
        if let Some(stale) = self.by_name.get(name).copied() {
            if stale != index {
                self.by_index.remove(&stale);
                self.by_name.remove(name);
            }
        }
    }

    /// Remove the interface with `index`.
    pub fn remove(&mut self, index: u32) -> Option<Interface> {
        let interface = self.by_index.remove(&index)?;
        if self.by_name.get(&interface.name) == Some(&index) {
            self.by_name.remove(&interface.name);
        }
        Some(interface)
    }

    /// Attach a dataplane binding. Returns the updated interface.
    pub fn bind(&mut self, index: u32, id: DataplaneId) -> Option<Interface> {
        let interface = self.by_index.get_mut(&index)?;
        interface.dataplane = Some(id);
        Some(interface.clone())
    }

    pub fn by_index(&self, index: u32) -> Option<&Interface> {
        self.by_index.get(&index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Interface> {
        self.by_name.get(name).and_then(|i| self.by_index.get(i))
    }

    /// Interfaces ordered by index.
    pub fn to_vec(&self) -> Vec<Interface> {
        let mut all: Vec<Interface> = self.by_index.values().cloned().collect();
        all.sort_by_key(|i| i.index);
        all
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_unchanged() {
        let mut table = InterfaceTable::new();
        assert!(matches!(table.upsert(2, "eth0", Weak::new()), LinkUpdate::Added(_)));
        assert!(matches!(table.upsert(2, "eth0", Weak::new()), LinkUpdate::Unchanged(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rename_keeps_index() {
        let mut table = InterfaceTable::new();
        table.upsert(2, "eth0", Weak::new());
        table.bind(2, DataplaneId(7));

        match table.upsert(2, "eth1", Weak::new()) {
            LinkUpdate::Renamed { interface, old } => {
                assert_eq!(old, "eth0");
                assert_eq!(interface.name, "eth1");
                assert_eq!(interface.dataplane, Some(DataplaneId(7)));
            }
            other => panic!("expected rename, got {:?}", other),
        }

        assert!(table.by_name("eth0").is_none());
        assert_eq!(table.by_name("eth1").unwrap().index, 2);
        assert_eq!(table.by_index(2).unwrap().name, "eth1");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut table = InterfaceTable::new();
        table.upsert(1, "lo", Weak::new());
        table.upsert(3, "veth0", Weak::new());
        let removed = table.remove(3).unwrap();
        assert_eq!(removed.name, "veth0");
        assert!(table.by_name("veth0").is_none());
        assert!(table.remove(3).is_none());
        assert_eq!(table.to_vec().len(), 1);
    }

    #[test]
    fn test_stale_name_evicted() {
        let mut table = InterfaceTable::new();
        table.upsert(4, "tap0", Weak::new());
        // tap0 recreated with a new index without a delete in between.
        table.upsert(9, "tap0", Weak::new());
        assert!(table.by_index(4).is_none());
        assert_eq!(table.by_name("tap0").unwrap().index, 9);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_swap_names() {
        let mut table = InterfaceTable::new();
        table.upsert(2, "a", Weak::new());
        table.upsert(3, "b", Weak::new());
        table.upsert(2, "tmp", Weak::new());
        table.upsert(3, "a", Weak::new());
        table.upsert(2, "b", Weak::new());
        assert_eq!(table.by_name("a").unwrap().index, 3);
        assert_eq!(table.by_name("b").unwrap().index, 2);
        assert!(table.by_name("tmp").is_none());
    }
}
