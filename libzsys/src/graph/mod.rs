use crate::error::{Result, ZsysError};
use crate::pooladapter::{DatasetHandle, DatasetKind, PoolAdapter, PropertySource, PropertyValue};
use slog_scope::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Generational index into the arena, per the design note that dataset
/// relationships are never modeled as raw owning back-pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: Arc<str>,
    pub kind: DatasetKind,
    pub properties: HashMap<String, PropertyValue>,
    parent: Option<DatasetId>,
    children: Vec<DatasetId>,
    origin: Option<DatasetId>,
    clones: Vec<DatasetId>,
}

impl Dataset {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn property_value(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|p| p.value.as_str())
    }

    pub fn parent(&self) -> Option<DatasetId> {
        self.parent
    }

    pub fn children(&self) -> &[DatasetId] {
        &self.children
    }

    pub fn origin(&self) -> Option<DatasetId> {
        self.origin
    }

    pub fn clones(&self) -> &[DatasetId] {
        &self.clones
    }
}

struct Slot {
    generation: u32,
    dataset: Option<Dataset>,
}

/// The cached, in-process view of everything the pool reports, rebuilt by
/// `refresh()` and otherwise served from memory behind the daemon's RwLock.
#[derive(Default)]
pub struct DatasetGraph {
    slots: Vec<Slot>,
    by_name: HashMap<Arc<str>, DatasetId>,
}

impl DatasetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-query the pool adapter and rebuild the graph from scratch,
    /// re-deriving parent/child and origin/clone links from dataset names.
    pub fn refresh(&mut self, pool: &dyn PoolAdapter) -> Result<()> {
        let handles = pool.list()?;
        self.slots.clear();
        self.by_name.clear();

        let filesystem_count = handles.iter().filter(|h| h.kind == DatasetKind::Filesystem).count();
        let snapshot_count = handles.len() - filesystem_count;

        for handle in &handles {
            self.insert(handle);
        }
        self.link_hierarchy();
        self.link_origins(&handles);

        debug!("refreshed dataset graph"; "filesystems" => filesystem_count, "snapshots" => snapshot_count);
        Ok(())
    }

    fn insert(&mut self, handle: &DatasetHandle) -> DatasetId {
        let name: Arc<str> = Arc::from(handle.name.as_str());
        let dataset = Dataset {
            name: Arc::clone(&name),
            kind: handle.kind,
            properties: handle.properties.clone(),
            parent: None,
            children: Vec::new(),
            origin: None,
            clones: Vec::new(),
        };
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            dataset: Some(dataset),
        });
        let id = DatasetId { index, generation: 0 };
        self.by_name.insert(name, id);
        id
    }

    fn link_hierarchy(&mut self) {
        let names: Vec<(DatasetId, Arc<str>)> = self
            .by_name
            .iter()
            .map(|(name, id)| (*id, Arc::clone(name)))
            .collect();
        for (id, name) in names {
            if let Some(parent_name) = parent_name_of(&name) {
                if let Some(&parent_id) = self.by_name.get(parent_name) {
                    self.set_parent(id, parent_id);
                }
            }
        }
    }

    fn link_origins(&mut self, handles: &[DatasetHandle]) {
        for handle in handles {
            if let Some(origin_name) = &handle.origin {
                if let (Some(&clone_id), Some(&origin_id)) =
                    (self.by_name.get(handle.name.as_str()), self.by_name.get(origin_name.as_str()))
                {
                    self.set_origin(clone_id, origin_id);
                }
            }
        }
    }

    fn set_parent(&mut self, child: DatasetId, parent: DatasetId) {
        if let Some(d) = self.get_mut(child) {
            d.parent = Some(parent);
        }
        if let Some(d) = self.get_mut(parent) {
            d.children.push(child);
        }
    }

    fn set_origin(&mut self, clone: DatasetId, origin: DatasetId) {
        if let Some(d) = self.get_mut(clone) {
            d.origin = Some(origin);
        }
        if let Some(d) = self.get_mut(origin) {
            d.clones.push(clone);
        }
    }

    pub fn get(&self, id: DatasetId) -> Option<&Dataset> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dataset.as_ref())
    }

    fn get_mut(&mut self, id: DatasetId) -> Option<&mut Dataset> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dataset.as_mut())
    }

    pub fn by_name(&self, name: &str) -> Result<DatasetId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ZsysError::NotFound(name.to_string()))
    }

    /// Look up a dataset by exact name; `.` resolves to the synthetic root
    /// (there is no single real node for it, so this returns `None` for it
    /// like any other name absent from the pool).
    pub fn find(&self, name: &str) -> Option<DatasetId> {
        if name == "." {
            return None;
        }
        self.by_name.get(name).copied()
    }

    /// Preorder iteration over every dataset, parents before children, per
    /// the Dataset Graph contract. Pool-top datasets (no parent in the
    /// graph) are visited in an unspecified but stable relative order.
    pub fn datasets(&self) -> Vec<DatasetId> {
        let mut roots: Vec<DatasetId> = self.iter().filter(|(_, d)| d.parent().is_none()).map(|(id, _)| id).collect();
        roots.sort_by_key(|id| self.get(*id).map(|d| d.name.clone()));
        let mut out = Vec::with_capacity(self.slots.len());
        for root in roots {
            self.visit_preorder(root, &mut out);
        }
        out
    }

    fn visit_preorder(&self, id: DatasetId, out: &mut Vec<DatasetId>) {
        out.push(id);
        if let Some(dataset) = self.get(id) {
            let mut children = dataset.children().to_vec();
            children.sort_by_key(|c| self.get(*c).map(|d| d.name.clone()));
            for child in children {
                self.visit_preorder(child, out);
            }
        }
    }

    /// True iff `d` itself is a snapshot, or any descendant (recursively) is.
    pub fn has_snapshot_in_hierarchy(&self, d: DatasetId) -> bool {
        match self.get(d) {
            Some(dataset) if dataset.kind == DatasetKind::Snapshot => true,
            Some(dataset) => dataset.children().iter().any(|&c| self.has_snapshot_in_hierarchy(c)),
            None => false,
        }
    }

    /// True iff every non-snapshot descendant of `d` (including `d` itself
    /// when it is a filesystem) has a snapshot tagged `snapname`. Guards
    /// recursive clone/promote so a partial snapshot set never gets cloned
    /// or promoted over.
    pub fn check_snapshot_hierarchy_integrity(&self, d: DatasetId, snapname: &str, require_all: bool) -> bool {
        let dataset = match self.get(d) {
            Some(d) => d,
            None => return false,
        };
        if dataset.kind == DatasetKind::Snapshot {
            return true;
        }
        let has_tag = dataset.children().iter().any(|&c| {
            self.get(c)
                .map(|child| child.kind == DatasetKind::Snapshot && snapshot_tag(&child.name) == Some(snapname))
                .unwrap_or(false)
        });
        if !has_tag {
            return false;
        }
        if !require_all {
            return true;
        }
        dataset
            .children()
            .iter()
            .filter(|&&c| self.get(c).map(|d| d.kind == DatasetKind::Filesystem).unwrap_or(false))
            .all(|&c| self.check_snapshot_hierarchy_integrity(c, snapname, require_all))
    }

    /// Every dataset that must be destroyed before `d` can be, deepest-first
    /// and deduplicated: for a filesystem, its descendants and its own
    /// snapshots (each transitively); for a snapshot, its clones and
    /// descendants whose snapshot tag matches, transitively. The returned
    /// order is the legal destruction order.
    pub fn dependencies(&self, d: DatasetId) -> Vec<DatasetId> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        self.collect_dependencies(d, &mut out, &mut seen);
        out
    }

    fn collect_dependencies(&self, d: DatasetId, out: &mut Vec<DatasetId>, seen: &mut std::collections::HashSet<DatasetId>) {
        let dataset = match self.get(d) {
            Some(d) => d,
            None => return,
        };
        match dataset.kind {
            // Descendants and own snapshots: every child (filesystem or
            // snapshot) must go first, each recursively resolved the same
            // way so a snapshot child pulls in its own clones too.
            DatasetKind::Filesystem => {
                for &child in dataset.children() {
                    self.collect_dependencies(child, out, seen);
                    self.push_dependency(child, out, seen);
                }
            }
            // Clones, and any other descendant-of-the-same-tag snapshot
            // (the siblings a recursive snapshot under this tag created),
            // transitively.
            DatasetKind::Snapshot => {
                for &clone in dataset.clones() {
                    self.collect_dependencies(clone, out, seen);
                    self.push_dependency(clone, out, seen);
                }
                if let Some(tag) = snapshot_tag(&dataset.name) {
                    if let Some(parent) = dataset.parent() {
                        for &fs_child in self.get(parent).map(|p| p.children().to_vec()).unwrap_or_default() {
                            if self.get(fs_child).map(|c| c.kind == DatasetKind::Filesystem).unwrap_or(false) {
                                for &grandchild in self.get(fs_child).map(|c| c.children().to_vec()).unwrap_or_default() {
                                    if self
                                        .get(grandchild)
                                        .map(|g| g.kind == DatasetKind::Snapshot && snapshot_tag(&g.name) == Some(tag))
                                        .unwrap_or(false)
                                    {
                                        self.collect_dependencies(grandchild, out, seen);
                                        self.push_dependency(grandchild, out, seen);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn push_dependency(&self, id: DatasetId, out: &mut Vec<DatasetId>, seen: &mut std::collections::HashSet<DatasetId>) {
        if seen.insert(id) {
            out.push(id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DatasetId, &Dataset)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.dataset.as_ref().map(|d| {
                (
                    DatasetId {
                        index,
                        generation: slot.generation,
                    },
                    d,
                )
            })
        })
    }

    /// Resolve a typed property's source-aware value by walking the
    /// dataset's own entry, falling back to its parent chain. Mirrors the
    /// pool adapter's own inheritance rule so the graph stays consistent
    /// with whatever the pool reports directly.
    pub fn resolve_property(&self, id: DatasetId, key: &str) -> Option<PropertyValue> {
        let dataset = self.get(id)?;
        if let Some(value) = dataset.property(key) {
            if value.source != PropertySource::Default {
                return Some(value.clone());
            }
        }
        let mut cursor = dataset.parent();
        while let Some(parent_id) = cursor {
            let parent = self.get(parent_id)?;
            if let Some(value) = parent.property(key) {
                if value.source != PropertySource::Default {
                    return Some(PropertyValue::new(value.value.clone(), PropertySource::Inherited));
                }
            }
            cursor = parent.parent();
        }
        dataset.property(key).cloned()
    }
}

fn snapshot_tag(name: &str) -> Option<&str> {
    name.rsplit_once('@').map(|(_, tag)| tag)
}

fn parent_name_of(name: &str) -> Option<&str> {
    if let Some(idx) = name.find('@') {
        return Some(&name[..idx]);
    }
    let idx = name.rfind('/')?;
    Some(&name[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pooladapter::mock::MemoryPoolAdapter;

    #[test]
    fn refresh_links_parent_and_snapshot_origin() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT").unwrap();
        pool.create_filesystem("rpool/ROOT/child").unwrap();
        pool.create_snapshot("rpool/ROOT/child", "tag1").unwrap();
        pool.clone_snapshot("rpool/ROOT/child@tag1", "rpool/ROOT/clone").unwrap();

        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();

        let child = graph.by_name("rpool/ROOT/child").unwrap();
        let root = graph.by_name("rpool/ROOT").unwrap();
        assert_eq!(graph.get(child).unwrap().parent(), Some(root));

        let clone = graph.by_name("rpool/ROOT/clone").unwrap();
        let snapshot = graph.by_name("rpool/ROOT/child@tag1").unwrap();
        assert_eq!(graph.get(clone).unwrap().origin(), Some(snapshot));
        assert!(graph.get(snapshot).unwrap().clones().contains(&clone));
    }

    #[test]
    fn datasets_visits_parents_before_children() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT").unwrap();
        pool.create_filesystem("rpool/ROOT/a").unwrap();
        pool.create_filesystem("rpool/ROOT/a/b").unwrap();

        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();

        let order: Vec<String> = graph
            .datasets()
            .into_iter()
            .map(|id| graph.get(id).unwrap().name.to_string())
            .collect();
        let root_pos = order.iter().position(|n| n == "rpool/ROOT").unwrap();
        let a_pos = order.iter().position(|n| n == "rpool/ROOT/a").unwrap();
        let b_pos = order.iter().position(|n| n == "rpool/ROOT/a/b").unwrap();
        assert!(root_pos < a_pos);
        assert!(a_pos < b_pos);
    }

    #[test]
    fn check_snapshot_hierarchy_integrity_requires_every_descendant() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/ubuntu_init").unwrap();
        pool.create_filesystem("rpool/ROOT/ubuntu_init/var").unwrap();
        pool.create_snapshot("rpool/ROOT/ubuntu_init", "tag1").unwrap();

        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();
        let root = graph.by_name("rpool/ROOT/ubuntu_init").unwrap();
        assert!(!graph.check_snapshot_hierarchy_integrity(root, "tag1", true));

        pool.create_snapshot("rpool/ROOT/ubuntu_init/var", "tag1").unwrap();
        graph.refresh(&pool).unwrap();
        let root = graph.by_name("rpool/ROOT/ubuntu_init").unwrap();
        assert!(graph.check_snapshot_hierarchy_integrity(root, "tag1", true));
    }

    #[test]
    fn dependencies_put_clones_before_their_origin() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/a").unwrap();
        pool.create_snapshot("rpool/ROOT/a", "s").unwrap();
        pool.clone_snapshot("rpool/ROOT/a@s", "rpool/ROOT/b").unwrap();

        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();
        let a = graph.by_name("rpool/ROOT/a").unwrap();
        let snapshot = graph.by_name("rpool/ROOT/a@s").unwrap();
        let clone = graph.by_name("rpool/ROOT/b").unwrap();

        let deps = graph.dependencies(a);
        let snapshot_pos = deps.iter().position(|&id| id == snapshot).unwrap();
        let clone_pos = deps.iter().position(|&id| id == clone).unwrap();
        assert!(clone_pos < snapshot_pos, "clone must be destroyed before its origin snapshot");
    }
}
