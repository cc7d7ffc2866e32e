use super::{not_found, DatasetHandle, DatasetKind, PoolAdapter, PropertySource, PropertyValue};
use crate::error::{Result, ZsysError};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    kind: DatasetKind,
    origin: Option<String>,
    local: HashMap<String, String>,
}

impl Entry {
    fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            origin: None,
            local: HashMap::new(),
        }
    }
}

/// In-memory simulation of a pool, used by the test suite in place of a real
/// `zfs`/`zpool` binary. Inherits properties by walking the `/`-separated
/// dataset hierarchy rather than talking to any real storage.
#[derive(Default)]
pub struct MemoryPoolAdapter {
    datasets: Mutex<HashMap<String, Entry>>,
}

impl MemoryPoolAdapter {
    pub fn new() -> Self {
        Self {
            datasets: Mutex::new(HashMap::new()),
        }
    }

    fn parent_of(name: &str) -> Option<&str> {
        if let Some(idx) = name.rfind('@') {
            return Some(&name[..idx]);
        }
        let idx = name.rfind('/')?;
        Some(&name[..idx])
    }

    fn resolve(&self, datasets: &HashMap<String, Entry>, name: &str, key: &str) -> PropertyValue {
        if let Some(entry) = datasets.get(name) {
            if let Some(v) = entry.local.get(key) {
                return PropertyValue::new(v.clone(), PropertySource::Local);
            }
        }
        let mut cursor = Self::parent_of(name);
        while let Some(parent_name) = cursor {
            if let Some(parent) = datasets.get(parent_name) {
                if let Some(v) = parent.local.get(key) {
                    return PropertyValue::new(v.clone(), PropertySource::Inherited);
                }
            }
            cursor = Self::parent_of(parent_name);
        }
        PropertyValue::new(String::new(), PropertySource::Default)
    }
}

impl PoolAdapter for MemoryPoolAdapter {
    fn list(&self) -> Result<Vec<DatasetHandle>> {
        let datasets = self.datasets.lock().unwrap();
        let names: Vec<String> = datasets.keys().cloned().collect();
        Ok(names
            .into_iter()
            .map(|name| {
                let entry = &datasets[&name];
                let properties = entry
                    .local
                    .keys()
                    .map(|k| (k.clone(), self.resolve(&datasets, &name, k)))
                    .collect();
                DatasetHandle {
                    name: name.clone(),
                    kind: entry.kind,
                    origin: entry.origin.clone(),
                    properties,
                }
            })
            .collect())
    }

    fn get_property(&self, dataset: &str, key: &str) -> Result<PropertyValue> {
        let datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(dataset) {
            return Err(not_found(dataset));
        }
        Ok(self.resolve(&datasets, dataset, key))
    }

    fn set_property(&self, dataset: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.get_mut(dataset).ok_or_else(|| not_found(dataset))?;
        match value {
            Some(v) => {
                entry.local.insert(key.to_string(), v.to_string());
            }
            None => {
                entry.local.remove(key);
            }
        }
        Ok(())
    }

    fn create_filesystem(&self, name: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        if datasets.contains_key(name) {
            return Err(ZsysError::Conflict(name.to_string(), "already exists".to_string()));
        }
        datasets.insert(name.to_string(), Entry::new(DatasetKind::Filesystem));
        Ok(())
    }

    fn create_snapshot(&self, dataset: &str, snapshot_name: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(dataset) {
            return Err(not_found(dataset));
        }
        let full_name = format!("{}@{}", dataset, snapshot_name);
        if datasets.contains_key(&full_name) {
            return Err(ZsysError::Conflict(full_name, "already exists".to_string()));
        }
        let source_local = datasets[dataset].local.clone();
        let mut entry = Entry::new(DatasetKind::Snapshot);
        entry.local = source_local;
        datasets.insert(full_name, entry);
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(snapshot) {
            return Err(not_found(snapshot));
        }
        if datasets.contains_key(target) {
            return Err(ZsysError::Conflict(target.to_string(), "already exists".to_string()));
        }
        let mut entry = Entry::new(DatasetKind::Filesystem);
        entry.origin = Some(snapshot.to_string());
        datasets.insert(target.to_string(), entry);
        Ok(())
    }

    fn promote(&self, clone: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        let origin = datasets
            .get(clone)
            .ok_or_else(|| not_found(clone))?
            .origin
            .clone()
            .ok_or_else(|| ZsysError::IntegrityViolation(format!("{} has no origin to promote over", clone)))?;
        let origin_dataset = Self::parent_of(&origin)
            .ok_or_else(|| ZsysError::IntegrityViolation(format!("malformed snapshot name {}", origin)))?
            .to_string();
        let grandparent_origin = datasets.get(&origin_dataset).and_then(|e| e.origin.clone());

        if let Some(entry) = datasets.get_mut(&origin_dataset) {
            entry.origin = Some(format!("{}@{}", clone, origin.rsplit('@').next().unwrap_or("")));
        }
        if let Some(entry) = datasets.get_mut(clone) {
            entry.origin = grandparent_origin;
        }
        Ok(())
    }

    fn rename(&self, dataset: &str, new_name: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.remove(dataset).ok_or_else(|| not_found(dataset))?;
        datasets.insert(new_name.to_string(), entry);
        Ok(())
    }

    fn destroy(&self, dataset: &str) -> Result<()> {
        let mut datasets = self.datasets.lock().unwrap();
        datasets.remove(dataset).ok_or_else(|| not_found(dataset))?;
        Ok(())
    }

    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>> {
        let datasets = self.datasets.lock().unwrap();
        Ok(datasets
            .iter()
            .filter(|(_, entry)| entry.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_inherited_until_set_locally() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT").unwrap();
        pool.create_filesystem("rpool/ROOT/child").unwrap();
        pool.set_property("rpool/ROOT", "canmount", Some("on")).unwrap();

        let inherited = pool.get_property("rpool/ROOT/child", "canmount").unwrap();
        assert_eq!(inherited.source, PropertySource::Inherited);
        assert_eq!(inherited.value, "on");

        pool.set_property("rpool/ROOT/child", "canmount", Some("off")).unwrap();
        let local = pool.get_property("rpool/ROOT/child", "canmount").unwrap();
        assert_eq!(local.source, PropertySource::Local);
        assert_eq!(local.value, "off");
    }

    #[test]
    fn promote_reparents_origin() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/a").unwrap();
        pool.create_snapshot("rpool/ROOT/a", "tag1").unwrap();
        pool.clone_snapshot("rpool/ROOT/a@tag1", "rpool/ROOT/b").unwrap();

        pool.promote("rpool/ROOT/b").unwrap();

        let datasets = pool.datasets.lock().unwrap();
        assert!(datasets["rpool/ROOT/a"].origin.is_some());
        assert!(datasets["rpool/ROOT/b"].origin.is_none());
    }
}
