pub mod mock;
pub mod zfs;

use crate::error::{Result, ZsysError};
use std::collections::HashMap;
use std::fmt;

/// A property value paired with the source zsys observed it from, mirroring
/// the `value\tsource` form the underlying pool tooling reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    pub value: String,
    pub source: PropertySource,
}

impl PropertyValue {
    pub fn new(value: impl Into<String>, source: PropertySource) -> Self {
        Self {
            value: value.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PropertySource {
    Local,
    Inherited,
    Default,
    #[strum(serialize = "none")]
    None_,
    Temporary,
    #[strum(serialize = "-")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
}

/// A flat view of one dataset or snapshot as reported by the pool, prior to
/// being woven into the in-memory dataset graph.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    pub name: String,
    pub kind: DatasetKind,
    pub origin: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
}

impl DatasetHandle {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

impl fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Seam between the transactional dataset engine and the underlying pool
/// tooling. Every mutating call here is synchronous and expected to be
/// wrapped by the caller's pool-mutation lock; implementations do not need
/// to be internally thread-safe.
pub trait PoolAdapter: Send + Sync {
    /// Enumerate every filesystem and snapshot currently known to the pool.
    fn list(&self) -> Result<Vec<DatasetHandle>>;

    fn get_property(&self, dataset: &str, key: &str) -> Result<PropertyValue>;

    /// Set `key` to `value` as a local property, or clear it back to
    /// inherited/default when `value` is `None`.
    fn set_property(&self, dataset: &str, key: &str, value: Option<&str>) -> Result<()>;

    fn create_filesystem(&self, name: &str) -> Result<()>;

    fn create_snapshot(&self, dataset: &str, snapshot_name: &str) -> Result<()>;

    /// Clone `snapshot` (a fully qualified `dataset@tag` name) into a new
    /// filesystem at `target`.
    fn clone_snapshot(&self, snapshot: &str, target: &str) -> Result<()>;

    /// Re-parent `clone`'s origin snapshot to make `clone` the base of the
    /// lineage it shares with its former origin.
    fn promote(&self, clone: &str) -> Result<()>;

    fn rename(&self, dataset: &str, new_name: &str) -> Result<()>;

    /// Irreversibly destroy a dataset or snapshot. Never wrapped in the
    /// transaction engine's compensation stack.
    fn destroy(&self, dataset: &str) -> Result<()>;

    /// Names of every filesystem whose origin is `snapshot`. Used to refuse
    /// destruction of a snapshot with living clones.
    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>>;
}

pub fn not_found(dataset: impl Into<String>) -> ZsysError {
    ZsysError::NotFound(dataset.into())
}
