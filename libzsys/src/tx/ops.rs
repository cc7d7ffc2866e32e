//! The generic transactional dataset mutations: `create`, `clone_dataset`,
//! `promote`, `destroy`, `set_property`. Each mutating call here records a
//! compensation on the caller's `Transaction`, except `destroy`, which is
//! never offered inside one.

use crate::error::{Result, ZsysError};
use crate::graph::{DatasetGraph, DatasetId};
use crate::naming;
use crate::pooladapter::{DatasetKind, PoolAdapter, PropertySource};
use crate::properties;
use crate::tx::Transaction;

/// Create a filesystem at `path`, optionally setting its mountpoint and
/// canmount. Compensation destroys it.
pub fn create(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    path: &str,
    mountpoint: Option<&str>,
    canmount: Option<&str>,
) -> Result<DatasetId> {
    pool.create_filesystem(path)?;
    if let Some(m) = mountpoint {
        pool.set_property(path, "mountpoint", Some(m))?;
    }
    if let Some(c) = canmount {
        pool.set_property(path, "canmount", Some(c))?;
    }
    graph.refresh(pool)?;
    let id = graph.by_name(path)?;

    let path_owned = path.to_string();
    tx.push_compensation(move |graph, pool| {
        if let Err(err) = pool.destroy(&path_owned) {
            slog_scope::warn!("failed to unwind create of {}: {}", path_owned, err);
        }
        let _ = graph.refresh(pool);
    });
    Ok(id)
}

/// Idempotent property set: a no-op when `force` is false and the current
/// source isn't `local`/`default`/`none`/empty. Compensation restores the
/// previous value (or clears it back to inherited/default).
pub fn set_property(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    name: &str,
    key: &str,
    value: &str,
    force: bool,
) -> Result<()> {
    let id = graph.by_name(name)?;
    // Inheritance-aware: a property only present on an ancestor still reads
    // back as `Inherited` here even though this dataset carries no local
    // entry for it yet.
    let effective = graph.resolve_property(id, key);

    if !force {
        if let Some(pv) = &effective {
            let overridable = matches!(pv.source, PropertySource::Local | PropertySource::Default | PropertySource::None_);
            if !overridable {
                return Ok(());
            }
        }
    }

    // What to restore on unwind: this dataset's own local override, if any,
    // or `None` to fall back to inherited/default if it never had one.
    let previous_local = graph.get(id).and_then(|d| d.property(key)).cloned();

    pool.set_property(name, key, Some(value))?;
    graph.refresh(pool)?;

    let name_owned = name.to_string();
    let key_owned = key.to_string();
    tx.push_compensation(move |graph, pool| {
        let restore = previous_local.as_ref().map(|pv| pv.value.as_str());
        if let Err(err) = pool.set_property(&name_owned, &key_owned, restore) {
            slog_scope::warn!("failed to restore property {} on {}: {}", key_owned, name_owned, err);
        }
        let _ = graph.refresh(pool);
    });
    Ok(())
}

/// Clone `snapshot_name` into a new root derived from `suffix` (per the
/// clone name derivation rule), optionally recursing over every descendant
/// filesystem's snapshot of the same tag. Returns the new root's name.
pub fn clone_dataset(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    snapshot_name: &str,
    suffix: &str,
    ignore_error_on_exists: bool,
    recursive: bool,
) -> Result<String> {
    if suffix.is_empty() {
        return Err(ZsysError::Usage("clone suffix must not be empty".to_string()));
    }
    let source_id = graph.by_name(snapshot_name)?;
    let source = graph.get(source_id).ok_or_else(|| ZsysError::NotFound(snapshot_name.to_string()))?;
    if source.kind != DatasetKind::Snapshot {
        return Err(ZsysError::Conflict(snapshot_name.to_string(), "clone source must be a snapshot".to_string()));
    }
    let tag = snapshot_name
        .rsplit_once('@')
        .map(|(_, t)| t.to_string())
        .ok_or_else(|| ZsysError::Usage(format!("{} is not a snapshot name", snapshot_name)))?;
    let parent_fs = source
        .parent()
        .ok_or_else(|| ZsysError::IntegrityViolation(format!("{} has no owning filesystem", snapshot_name)))?;

    if recursive && !graph.check_snapshot_hierarchy_integrity(parent_fs, &tag, true) {
        return Err(ZsysError::IntegrityViolation(format!(
            "{} hierarchy is missing a matching snapshot somewhere below it",
            snapshot_name
        )));
    }

    let target_root = naming::derive_clone_target(snapshot_name, suffix)
        .ok_or_else(|| ZsysError::Usage(format!("cannot derive a clone target for {}", snapshot_name)))?;
    clone_one(tx, graph, pool, source_id, &target_root, ignore_error_on_exists)?;

    if recursive {
        clone_descendants(tx, graph, pool, parent_fs, &tag, suffix, ignore_error_on_exists)?;
    }

    graph.refresh(pool)?;
    Ok(target_root)
}

fn clone_descendants(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    fs_id: DatasetId,
    tag: &str,
    suffix: &str,
    ignore_error_on_exists: bool,
) -> Result<()> {
    let children: Vec<DatasetId> = graph.get(fs_id).map(|d| d.children().to_vec()).unwrap_or_default();
    for child_id in children {
        let child = match graph.get(child_id) {
            Some(d) => d,
            None => continue,
        };
        if child.kind != DatasetKind::Filesystem {
            continue;
        }
        let snapshot_name = format!("{}@{}", child.name, tag);
        if let Ok(snapshot_id) = graph.by_name(&snapshot_name) {
            let target = naming::derive_clone_target(&snapshot_name, suffix)
                .ok_or_else(|| ZsysError::Usage(format!("cannot derive a clone target for {}", snapshot_name)))?;
            clone_one(tx, graph, pool, snapshot_id, &target, ignore_error_on_exists)?;
        }
        clone_descendants(tx, graph, pool, child_id, tag, suffix, ignore_error_on_exists)?;
    }
    Ok(())
}

fn clone_one(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    snapshot_id: DatasetId,
    target: &str,
    ignore_error_on_exists: bool,
) -> Result<()> {
    if graph.find(target).is_some() {
        if ignore_error_on_exists {
            return Ok(());
        }
        return Err(ZsysError::Conflict(target.to_string(), "clone target already exists".to_string()));
    }
    let snapshot_name = graph
        .get(snapshot_id)
        .ok_or_else(|| ZsysError::NotFound("snapshot vanished".to_string()))?
        .name
        .to_string();

    pool.clone_snapshot(&snapshot_name, target)?;
    propagate_clone_properties(pool, &snapshot_name, target)?;
    graph.refresh(pool)?;

    let target_owned = target.to_string();
    tx.push_compensation(move |graph, pool| {
        if let Err(err) = pool.destroy(&target_owned) {
            slog_scope::warn!("failed to unwind clone of {}: {}", target_owned, err);
        }
        let _ = graph.refresh(pool);
    });
    Ok(())
}

/// Propagate `mountpoint` (only if the mirror's source is `local`),
/// `canmount` (translated `on` -> `noauto`), `bootfs`, and
/// `last_booted_kernel` from a snapshot's mirrors onto its clone.
/// `bootfs-datasets` is deliberately excluded: association semantics are
/// the caller's job.
fn propagate_clone_properties(pool: &dyn PoolAdapter, snapshot_name: &str, target: &str) -> Result<()> {
    if let Some(mountpoint) = read_mirror(pool, snapshot_name, properties::MOUNTPOINT_MIRROR) {
        if mountpoint.source == PropertySource::Local {
            pool.set_property(target, "mountpoint", Some(&mountpoint.value))?;
        }
    }
    if let Some(canmount) = read_mirror(pool, snapshot_name, properties::CANMOUNT_MIRROR) {
        let value = if canmount.value == "on" { "noauto" } else { canmount.value.as_str() };
        pool.set_property(target, "canmount", Some(value))?;
    }
    if let Some(bootfs) = read_mirror(pool, snapshot_name, properties::BOOTFS) {
        pool.set_property(target, properties::BOOTFS, Some(&bootfs.value))?;
    }
    if let Some(kernel) = read_mirror(pool, snapshot_name, properties::LAST_BOOTED_KERNEL) {
        pool.set_property(target, properties::LAST_BOOTED_KERNEL, Some(&kernel.value))?;
    }
    Ok(())
}

fn read_mirror(pool: &dyn PoolAdapter, snapshot_name: &str, mirror_key: &str) -> Option<crate::pooladapter::PropertyValue> {
    let raw = pool.get_property(snapshot_name, mirror_key).ok()?;
    if raw.value.is_empty() {
        return None;
    }
    Some(properties::decode(&raw.value))
}

/// Promote `name`, repeating for each further origin hop until the chain is
/// exhausted, then recursing into its non-snapshot children. Refuses
/// snapshots. Compensation re-promotes the original root in a fresh,
/// isolated transaction.
pub fn promote(tx: &mut Transaction, graph: &mut DatasetGraph, pool: &dyn PoolAdapter, name: &str) -> Result<()> {
    let id = graph.by_name(name)?;
    if graph.get(id).ok_or_else(|| ZsysError::NotFound(name.to_string()))?.kind == DatasetKind::Snapshot {
        return Err(ZsysError::Conflict(name.to_string(), "cannot promote a snapshot".to_string()));
    }

    promote_chain(graph, pool, name)?;

    let children: Vec<DatasetId> = graph
        .by_name(name)
        .ok()
        .and_then(|id| graph.get(id))
        .map(|d| d.children().to_vec())
        .unwrap_or_default();
    for child_id in children {
        let child_fs = graph.get(child_id).filter(|d| d.kind == DatasetKind::Filesystem).map(|d| d.name.to_string());
        if let Some(child_name) = child_fs {
            tx.nested(graph, pool, |sub_tx, graph, pool| promote(sub_tx, graph, pool, &child_name))?;
        }
    }

    let name_owned = name.to_string();
    tx.push_compensation(move |graph, pool| {
        let result = crate::tx::run(graph, pool, |sub_tx, graph, pool| promote(sub_tx, graph, pool, &name_owned));
        if let Err(err) = result {
            slog_scope::warn!("failed to unwind promote of {}: {}", name_owned, err);
        }
    });
    Ok(())
}

/// Repeatedly promote `name` while it has a non-empty origin, verifying
/// hierarchy integrity before each hop. Returns whether any promotion ran.
/// Shared by the generic `Promote` operation and `CommitBoot`.
pub fn promote_chain(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, name: &str) -> Result<bool> {
    let mut changed = false;
    loop {
        let id = graph.by_name(name)?;
        let origin = match graph.get(id).and_then(|d| d.origin()) {
            Some(o) => o,
            None => break,
        };
        let origin_snapshot_name = graph.get(origin).unwrap().name.to_string();
        let origin_fs = graph
            .get(origin)
            .and_then(|d| d.parent())
            .ok_or_else(|| ZsysError::IntegrityViolation(format!("{} has no owning filesystem", origin_snapshot_name)))?;
        let tag = origin_snapshot_name
            .rsplit_once('@')
            .map(|(_, t)| t.to_string())
            .ok_or_else(|| ZsysError::IntegrityViolation(format!("malformed snapshot name {}", origin_snapshot_name)))?;

        if !graph.check_snapshot_hierarchy_integrity(origin_fs, &tag, true) {
            return Err(ZsysError::IntegrityViolation(format!(
                "{} hierarchy is missing a matching snapshot somewhere below it",
                origin_snapshot_name
            )));
        }

        pool.promote(name)?;
        graph.refresh(pool)?;
        changed = true;
    }
    Ok(changed)
}

/// Destroy `name` in the no-transaction scope: refuses if any snapshot in
/// its subtree has living clones, and refuses destroying a filesystem that
/// has snapshots anywhere below it (destroy the specific snapshot tag
/// instead). Never reversible, never offered inside a `Transaction`.
pub fn destroy(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, name: &str) -> Result<()> {
    let id = graph.by_name(name)?;
    ensure_no_living_clones(graph, id)?;

    let is_filesystem = graph.get(id).map(|d| d.kind == DatasetKind::Filesystem).unwrap_or(false);
    if is_filesystem && graph.has_snapshot_in_hierarchy(id) {
        return Err(ZsysError::Conflict(
            name.to_string(),
            "dataset has snapshots in its hierarchy; destroy a specific snapshot instead".to_string(),
        ));
    }

    destroy_recursive(graph, pool, id)?;
    graph.refresh(pool)?;
    Ok(())
}

fn ensure_no_living_clones(graph: &DatasetGraph, id: DatasetId) -> Result<()> {
    let dataset = graph.get(id).ok_or_else(|| ZsysError::NotFound("dataset vanished".to_string()))?;
    if dataset.kind == DatasetKind::Snapshot && !dataset.clones().is_empty() {
        return Err(ZsysError::Conflict(dataset.name.to_string(), "snapshot has living clones".to_string()));
    }
    let children = dataset.children().to_vec();
    for child in children {
        ensure_no_living_clones(graph, child)?;
    }
    Ok(())
}

fn destroy_recursive(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, id: DatasetId) -> Result<()> {
    let children: Vec<DatasetId> = graph.get(id).map(|d| d.children().to_vec()).unwrap_or_default();
    for child in children {
        destroy_recursive(graph, pool, child)?;
    }
    let name = graph.get(id).ok_or_else(|| ZsysError::NotFound("dataset vanished".to_string()))?.name.to_string();
    pool.destroy(&name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pooladapter::mock::MemoryPoolAdapter;

    fn setup() -> (MemoryPoolAdapter, DatasetGraph) {
        let pool = MemoryPoolAdapter::new();
        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();
        (pool, graph)
    }

    #[test]
    fn create_then_cancel_reverts_graph() {
        let (pool, mut graph) = setup();
        let before: Vec<String> = graph.iter().map(|(_, d)| d.name.to_string()).collect();

        let result: Result<()> = crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            create(tx, graph, pool, "rpool/ROOT", None, None)?;
            Err(ZsysError::Cancelled)
        });
        assert!(result.is_err());

        let after: Vec<String> = graph.iter().map(|(_, d)| d.name.to_string()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn clone_derives_target_name_from_source_snapshot() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("pool/ROOT/ubuntu_1234").unwrap();
        pool.create_filesystem("pool/ROOT/ubuntu_1234/var").unwrap();
        pool.create_snapshot("pool/ROOT/ubuntu_1234/var", "snap").unwrap();
        graph.refresh(&pool).unwrap();

        let target = crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            clone_dataset(tx, graph, pool, "pool/ROOT/ubuntu_1234/var@snap", "abcd", false, false)
        })
        .unwrap();
        assert_eq!(target, "pool/ROOT/ubuntu_abcd/var");
    }

    #[test]
    fn recursive_clone_requires_full_snapshot_hierarchy() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("pool/ROOT/ubuntu").unwrap();
        pool.create_filesystem("pool/ROOT/ubuntu/var").unwrap();
        pool.create_snapshot("pool/ROOT/ubuntu", "snap").unwrap();
        graph.refresh(&pool).unwrap();

        let result: Result<String> = crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            clone_dataset(tx, graph, pool, "pool/ROOT/ubuntu@snap", "abcd", false, true)
        });
        assert!(matches!(result, Err(ZsysError::IntegrityViolation(_))));

        pool.create_snapshot("pool/ROOT/ubuntu/var", "snap").unwrap();
        graph.refresh(&pool).unwrap();
        let target = crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            clone_dataset(tx, graph, pool, "pool/ROOT/ubuntu@snap", "abcd", false, true)
        })
        .unwrap();
        assert_eq!(target, "pool/ROOT/ubuntu_abcd");
        graph.refresh(&pool).unwrap();
        assert!(graph.find("pool/ROOT/ubuntu_abcd/var").is_some());
    }

    #[test]
    fn promote_then_promote_again_is_a_no_op() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("rpool/ROOT/a").unwrap();
        pool.create_snapshot("rpool/ROOT/a", "s").unwrap();
        pool.clone_snapshot("rpool/ROOT/a@s", "rpool/ROOT/b").unwrap();
        graph.refresh(&pool).unwrap();

        crate::tx::run(&mut graph, &pool, |tx, graph, pool| promote(tx, graph, pool, "rpool/ROOT/b")).unwrap();
        let b = graph.by_name("rpool/ROOT/b").unwrap();
        assert!(graph.get(b).unwrap().origin().is_none());

        crate::tx::run(&mut graph, &pool, |tx, graph, pool| promote(tx, graph, pool, "rpool/ROOT/b")).unwrap();
        let b = graph.by_name("rpool/ROOT/b").unwrap();
        assert!(graph.get(b).unwrap().origin().is_none());
    }

    #[test]
    fn destroy_refuses_when_snapshot_has_living_clone() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("rpool/ROOT/ubuntu_a").unwrap();
        pool.create_snapshot("rpool/ROOT/ubuntu_a", "s").unwrap();
        pool.clone_snapshot("rpool/ROOT/ubuntu_a@s", "rpool/ROOT/ubuntu_b").unwrap();
        graph.refresh(&pool).unwrap();

        let before: Vec<String> = graph.iter().map(|(_, d)| d.name.to_string()).collect();
        let result = destroy(&mut graph, &pool, "rpool/ROOT/ubuntu_a@s");
        assert!(matches!(result, Err(ZsysError::Conflict(_, _))));
        let after: Vec<String> = graph.iter().map(|(_, d)| d.name.to_string()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn destroy_refuses_filesystem_with_snapshot_in_subtree() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("rpool/ROOT/ubuntu_a").unwrap();
        pool.create_snapshot("rpool/ROOT/ubuntu_a", "s").unwrap();
        graph.refresh(&pool).unwrap();

        let result = destroy(&mut graph, &pool, "rpool/ROOT/ubuntu_a");
        assert!(matches!(result, Err(ZsysError::Conflict(_, _))));

        destroy(&mut graph, &pool, "rpool/ROOT/ubuntu_a@s").unwrap();
        destroy(&mut graph, &pool, "rpool/ROOT/ubuntu_a").unwrap();
        assert!(graph.find("rpool/ROOT/ubuntu_a").is_none());
    }

    #[test]
    fn set_property_is_noop_unless_force_on_inherited_source() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("rpool/ROOT").unwrap();
        pool.create_filesystem("rpool/ROOT/child").unwrap();
        pool.set_property("rpool/ROOT", "canmount", Some("on")).unwrap();
        graph.refresh(&pool).unwrap();

        crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            set_property(tx, graph, pool, "rpool/ROOT/child", "canmount", "off", false)
        })
        .unwrap();
        graph.refresh(&pool).unwrap();
        let child = graph.by_name("rpool/ROOT/child").unwrap();
        assert_eq!(graph.get(child).unwrap().property_value("canmount"), Some("on"));

        crate::tx::run(&mut graph, &pool, |tx, graph, pool| {
            set_property(tx, graph, pool, "rpool/ROOT/child", "canmount", "off", true)
        })
        .unwrap();
        graph.refresh(&pool).unwrap();
        let child = graph.by_name("rpool/ROOT/child").unwrap();
        assert_eq!(graph.get(child).unwrap().property_value("canmount"), Some("off"));
    }
}
