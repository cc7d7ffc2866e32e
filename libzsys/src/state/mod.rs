use crate::error::{Result, ZsysError};
use crate::graph::{DatasetGraph, DatasetId};
use crate::naming;
use crate::pooladapter::{DatasetKind, PoolAdapter};
use crate::properties::{self, encode};
use crate::tx::Transaction;
use chrono::{DateTime, Utc};
use std::fmt;

/// A logical system lineage anchored at a bootable root dataset.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub root: DatasetId,
}

#[derive(Debug, Clone)]
pub struct SystemState {
    pub id: String,
    pub dataset: DatasetId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: String,
    pub dataset: DatasetId,
}

/// The result of the first phase of a two-phase state removal: what would
/// be destroyed, and what dependents would be force-dropped along with it.
#[derive(Debug, Clone, Default)]
pub struct RemovalPlan {
    pub collateral: Vec<String>,
    pub forced: Vec<String>,
}

impl RemovalPlan {
    pub fn is_empty(&self) -> bool {
        self.collateral.is_empty() && self.forced.is_empty()
    }
}

impl fmt::Display for RemovalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.collateral.is_empty() {
            writeln!(f, "the following will also be removed:")?;
            for name in &self.collateral {
                writeln!(f, "  {}", name)?;
            }
        }
        if !self.forced.is_empty() {
            writeln!(f, "the following user states will be dissociated:")?;
            for name in &self.forced {
                writeln!(f, "  {}", name)?;
            }
        }
        Ok(())
    }
}

/// Find every machine anchored at a `bootfs=yes` filesystem.
pub fn find_machines(graph: &DatasetGraph) -> Vec<Machine> {
    let mut machines = Vec::new();
    for (id, dataset) in graph.iter() {
        if dataset.kind != DatasetKind::Filesystem {
            continue;
        }
        let is_root = dataset
            .property_value(properties::BOOTFS)
            .map(|v| v == "yes")
            .unwrap_or(false);
        if !is_root {
            continue;
        }
        if let Some(machine_id) = naming::machine_id(&dataset.name) {
            machines.push(Machine {
                id: machine_id.to_string(),
                root: id,
            });
        }
    }
    machines
}

/// System datasets associated with a machine: descendants of its root whose
/// mountpoint is under `/` or `/boot` and are mountable.
pub fn system_datasets(graph: &DatasetGraph, machine: &Machine) -> Vec<DatasetId> {
    let mut result = vec![machine.root];
    collect_system_descendants(graph, machine.root, &mut result);
    result
}

fn collect_system_descendants(graph: &DatasetGraph, id: DatasetId, out: &mut Vec<DatasetId>) {
    let dataset = match graph.get(id) {
        Some(d) => d,
        None => return,
    };
    for &child_id in dataset.children() {
        if let Some(child) = graph.get(child_id) {
            let mountable = child
                .property_value("canmount")
                .map(|v| v != "off")
                .unwrap_or(true);
            let under_root = child
                .property_value("mountpoint")
                .map(|m| m == "/" || m == "-" || m.starts_with("/boot") || !m.starts_with("/home"))
                .unwrap_or(true);
            if mountable && under_root {
                out.push(child_id);
            }
            collect_system_descendants(graph, child_id, out);
        }
    }
}

/// User datasets associated with a machine: datasets under `/home/...` whose
/// `bootfs-datasets` property is set.
pub fn user_datasets(graph: &DatasetGraph) -> Vec<DatasetId> {
    graph
        .iter()
        .filter(|(_, d)| {
            d.kind == DatasetKind::Filesystem
                && d.property_value("mountpoint")
                    .map(|m| m.starts_with("/home/"))
                    .unwrap_or(false)
                && d.property_value(properties::BOOTFS_DATASETS).is_some()
        })
        .map(|(id, _)| id)
        .collect()
}

fn associated_ids(graph: &DatasetGraph, user_dataset: DatasetId) -> Vec<String> {
    graph
        .get(user_dataset)
        .and_then(|d| d.property_value(properties::BOOTFS_DATASETS))
        .map(properties::split_bootfs_datasets)
        .unwrap_or_default()
}

fn snapshot_tag(name: &str) -> Option<&str> {
    name.rsplit_once('@').map(|(_, tag)| tag)
}

/// Take a recursive snapshot tagged `id` of `root`, capturing each
/// descendant's tracked properties with their sources as `value:source`
/// mirrors on the new snapshot.
fn snapshot_recursive(
    tx: &mut Transaction,
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    root: DatasetId,
    id: &str,
) -> Result<()> {
    let dataset = graph.get(root).ok_or_else(|| ZsysError::NotFound("dataset vanished".into()))?;
    if dataset.kind != DatasetKind::Filesystem {
        return Ok(());
    }
    let name = dataset.name.to_string();
    let children: Vec<DatasetId> = dataset.children().to_vec();

    pool.create_snapshot(&name, id)?;
    let snapshot_name = format!("{}@{}", name, id);

    let mirrors = [
        ("mountpoint", properties::MOUNTPOINT_MIRROR),
        ("canmount", properties::CANMOUNT_MIRROR),
        (properties::BOOTFS, properties::BOOTFS),
        (properties::LAST_BOOTED_KERNEL, properties::LAST_BOOTED_KERNEL),
    ];
    for (source_key, mirror_key) in mirrors {
        if let Some(value) = graph.resolve_property(root, source_key) {
            pool.set_property(&snapshot_name, mirror_key, Some(&encode(&value.value, value.source)))?;
        }
    }
    pool.set_property(&snapshot_name, properties::LAST_USED, Some(&Utc::now().timestamp().to_string()))?;

    {
        let name = name.clone();
        tx.push_compensation(move |_graph, pool| {
            if let Err(err) = pool.destroy(&format!("{}@{}", name, id)) {
                slog_scope::warn!("failed to unwind snapshot: {}", err);
            }
        });
    }

    for child_id in children {
        tx.nested(graph, pool, |sub_tx, graph, pool| {
            snapshot_recursive(sub_tx, graph, pool, child_id, id)
        })?;
    }

    graph.refresh(pool)?;
    Ok(())
}

/// System-state save: snapshot the machine's root (recursively) and every
/// user dataset currently associated with it via `bootfs-datasets`.
pub fn save_system_state(
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    machine: &Machine,
    id: Option<String>,
) -> Result<String> {
    let id = id.unwrap_or_else(naming::generate_id);
    crate::tx::run(graph, pool, |tx, graph, pool| {
        snapshot_recursive(tx, graph, pool, machine.root, &id)?;

        let associated: Vec<DatasetId> = user_datasets(graph)
            .into_iter()
            .filter(|&ud| associated_ids(graph, ud).contains(&machine.id))
            .collect();

        for user_dataset in associated {
            snapshot_recursive(tx, graph, pool, user_dataset, &id)?;
            if let Some(dataset) = graph.get(user_dataset) {
                let name = dataset.name.to_string();
                let snapshot_name = format!("{}@{}", name, id);
                let snapshot_id = graph.by_name(&snapshot_name)?;
                let mut ids = associated_ids(graph, snapshot_id);
                if !ids.iter().any(|existing| existing == &id) {
                    ids.push(id.clone());
                }
                pool.set_property(
                    &snapshot_name,
                    properties::BOOTFS_DATASETS,
                    Some(&properties::join_bootfs_datasets(&ids)),
                )?;
            }
        }
        graph.refresh(pool)?;
        Ok(id.clone())
    })
}

/// User-state save: snapshot only the user's home dataset, associated with
/// the machine's current system state.
pub fn save_user_state(
    graph: &mut DatasetGraph,
    pool: &dyn PoolAdapter,
    user_dataset: DatasetId,
    current_system_state_id: &str,
    id: Option<String>,
) -> Result<String> {
    let id = id.unwrap_or_else(naming::generate_id);
    crate::tx::run(graph, pool, |tx, graph, pool| {
        snapshot_recursive(tx, graph, pool, user_dataset, &id)?;
        let name = graph
            .get(user_dataset)
            .ok_or_else(|| ZsysError::NotFound("user dataset vanished".into()))?
            .name
            .to_string();
        let snapshot_name = format!("{}@{}", name, id);
        pool.set_property(
            &snapshot_name,
            properties::BOOTFS_DATASETS,
            Some(&properties::join_bootfs_datasets(&[current_system_state_id.to_string()])),
        )?;
        graph.refresh(pool)?;
        Ok(id.clone())
    })
}

/// Compute what removing a system state would collaterally remove, without
/// performing any mutation. The caller confirms, then calls
/// `remove_system_state` with `force=true`.
pub fn plan_system_state_removal(graph: &DatasetGraph, machine: &Machine, id: &str) -> Result<RemovalPlan> {
    let mut plan = RemovalPlan::default();
    for user_dataset in user_datasets(graph) {
        let mut ids = associated_ids(graph, user_dataset);
        if !ids.contains(&id.to_string()) {
            continue;
        }
        ids.retain(|i| i != id);
        let name = &graph.get(user_dataset).unwrap().name;
        if ids.is_empty() {
            plan.collateral.push(format!("{}@{}", name, id));
        } else {
            plan.forced.push(name.to_string());
        }
    }
    plan.collateral.push(format!("{}@{}", graph.get(machine.root).unwrap().name, id));
    Ok(plan)
}

/// Destroy a system state's snapshot and every user state left unattached
/// by its removal; rewrite `bootfs-datasets` on the rest.
pub fn remove_system_state(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, machine: &Machine, id: &str, force: bool) -> Result<RemovalPlan> {
    let plan = plan_system_state_removal(graph, machine, id)?;
    if !force {
        return Ok(plan);
    }

    for user_dataset in user_datasets(graph) {
        let mut ids = associated_ids(graph, user_dataset);
        if !ids.contains(&id.to_string()) {
            continue;
        }
        let name = graph.get(user_dataset).unwrap().name.to_string();
        ids.retain(|i| i != id);
        if ids.is_empty() {
            crate::tx::ops::destroy(graph, pool, &format!("{}@{}", name, id))?;
        } else {
            pool.set_property(&name, properties::BOOTFS_DATASETS, Some(&properties::join_bootfs_datasets(&ids)))?;
        }
    }

    let root_name = graph.get(machine.root).ok_or_else(|| ZsysError::NotFound(machine.id.clone()))?.name.to_string();
    crate::tx::ops::destroy(graph, pool, &format!("{}@{}", root_name, id))?;
    Ok(plan)
}

/// Remove a user state; refused unless it is unattached to any system
/// state, or `force` is set.
pub fn remove_user_state(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, user_dataset: DatasetId, force: bool) -> Result<()> {
    let ids = associated_ids(graph, user_dataset);
    if !ids.is_empty() && !force {
        return Err(ZsysError::Conflict(
            graph.get(user_dataset).map(|d| d.name.to_string()).unwrap_or_default(),
            "user state is associated with a system state".to_string(),
        ));
    }
    let name = graph.get(user_dataset).ok_or_else(|| ZsysError::NotFound("user dataset vanished".into()))?.name.to_string();
    crate::tx::ops::destroy(graph, pool, &name)?;
    Ok(())
}

/// Sever a user's history from a machine by rewriting `bootfs-datasets` on
/// every snapshot/clone that references the machine's states.
pub fn dissociate_user(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, machine: &Machine, user_dataset: DatasetId) -> Result<()> {
    let machine_state_ids: Vec<String> = {
        let mut ids = Vec::new();
        for (id, dataset) in graph.iter() {
            if dataset.kind == DatasetKind::Snapshot && dataset.parent() == Some(machine.root) {
                if let Some(tag) = snapshot_tag(&dataset.name) {
                    ids.push(tag.to_string());
                }
                let _ = id;
            }
        }
        ids
    };

    let dataset = graph.get(user_dataset).ok_or_else(|| ZsysError::NotFound("user dataset vanished".into()))?;
    let name = dataset.name.to_string();
    let mut ids = associated_ids(graph, user_dataset);
    ids.retain(|id| !machine_state_ids.contains(id));
    pool.set_property(&name, properties::BOOTFS_DATASETS, Some(&properties::join_bootfs_datasets(&ids)))?;

    for &child_id in dataset.clones() {
        if let Some(child) = graph.get(child_id) {
            let child_name = child.name.to_string();
            let mut child_ids = associated_ids(graph, child_id);
            child_ids.retain(|id| !machine_state_ids.contains(id));
            pool.set_property(
                &child_name,
                properties::BOOTFS_DATASETS,
                Some(&properties::join_bootfs_datasets(&child_ids)),
            )?;
        }
    }
    graph.refresh(pool)?;
    Ok(())
}

/// Create or reuse a user-data dataset mounted at `home`, associated with
/// the machine's current system state.
pub fn create_user_data(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, machine: &Machine, user: &str, home: &str, current_system_state_id: &str) -> Result<()> {
    let root_name = graph.get(machine.root).ok_or_else(|| ZsysError::NotFound(machine.id.clone()))?.name.to_string();
    let userdata_prefix = root_name.replacen("ROOT", "USERDATA", 1);
    let name = format!("{}/{}_{}", userdata_prefix, user, machine.id);

    if graph.by_name(&name).is_err() {
        pool.create_filesystem(&name)?;
    }
    pool.set_property(&name, "mountpoint", Some(home))?;
    pool.set_property(
        &name,
        properties::BOOTFS_DATASETS,
        Some(&properties::join_bootfs_datasets(&[current_system_state_id.to_string()])),
    )?;
    graph.refresh(pool)?;
    Ok(())
}

/// Find the dataset currently mounted at `home` and change its mountpoint.
pub fn change_home_on_user_data(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, home: &str, new_home: &str) -> Result<()> {
    let target = graph
        .iter()
        .find(|(_, d)| d.property_value("mountpoint") == Some(home))
        .map(|(id, _)| id)
        .ok_or_else(|| ZsysError::NotFound(home.to_string()))?;
    let name = graph.get(target).unwrap().name.to_string();
    pool.set_property(&name, "mountpoint", Some(new_home))?;
    graph.refresh(pool)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pooladapter::mock::MemoryPoolAdapter;

    fn setup() -> (MemoryPoolAdapter, DatasetGraph) {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/ubuntu_init").unwrap();
        pool.set_property("rpool/ROOT/ubuntu_init", properties::BOOTFS, Some("yes")).unwrap();
        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();
        (pool, graph)
    }

    fn the_machine(graph: &DatasetGraph) -> Machine {
        find_machines(graph).into_iter().next().unwrap()
    }

    #[test]
    fn finds_machine_from_bootfs_root() {
        let (_pool, graph) = setup();
        let machine = the_machine(&graph);
        assert_eq!(machine.id, "init");
    }

    #[test]
    fn save_system_state_snapshots_the_root() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);

        let id = save_system_state(&mut graph, &pool, &machine, Some("abcd".to_string())).unwrap();
        assert_eq!(id, "abcd");
        assert!(graph.by_name("rpool/ROOT/ubuntu_init@abcd").is_ok());
    }

    #[test]
    fn remove_system_state_without_force_only_plans() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);
        let id = save_system_state(&mut graph, &pool, &machine, Some("abcd".to_string())).unwrap();

        let plan = remove_system_state(&mut graph, &pool, &machine, &id, false).unwrap();
        assert!(!plan.is_empty());
        assert!(graph.by_name("rpool/ROOT/ubuntu_init@abcd").is_ok());
    }

    #[test]
    fn remove_system_state_with_force_destroys_the_snapshot() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);
        let id = save_system_state(&mut graph, &pool, &machine, Some("abcd".to_string())).unwrap();

        remove_system_state(&mut graph, &pool, &machine, &id, true).unwrap();
        assert!(graph.by_name("rpool/ROOT/ubuntu_init@abcd").is_err());
    }

    #[test]
    fn save_and_remove_user_state_round_trips() {
        let (pool, mut graph) = setup();
        pool.create_filesystem("rpool/USERDATA/alice_init").unwrap();
        pool.set_property("rpool/USERDATA/alice_init", "mountpoint", Some("/home/alice")).unwrap();
        graph.refresh(&pool).unwrap();
        let user_dataset = graph.by_name("rpool/USERDATA/alice_init").unwrap();

        let id = save_user_state(&mut graph, &pool, user_dataset, "sys1", Some("ustate1".to_string())).unwrap();
        assert_eq!(id, "ustate1");
        let snapshot = graph.by_name("rpool/USERDATA/alice_init@ustate1").unwrap();

        remove_user_state(&mut graph, &pool, snapshot, true).unwrap();
        assert!(graph.by_name("rpool/USERDATA/alice_init@ustate1").is_err());
    }

    #[test]
    fn remove_user_state_refuses_when_associated_unless_forced() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);
        pool.create_filesystem("rpool/USERDATA/alice_init").unwrap();
        pool.set_property("rpool/USERDATA/alice_init", "mountpoint", Some("/home/alice")).unwrap();
        graph.refresh(&pool).unwrap();
        let user_dataset = graph.by_name("rpool/USERDATA/alice_init").unwrap();

        let sys_id = save_system_state(&mut graph, &pool, &machine, Some("sys1".to_string())).unwrap();
        save_user_state(&mut graph, &pool, user_dataset, &sys_id, Some("ustate1".to_string())).unwrap();
        let snapshot = graph.by_name("rpool/USERDATA/alice_init@ustate1").unwrap();

        let err = remove_user_state(&mut graph, &pool, snapshot, false).unwrap_err();
        assert!(matches!(err, ZsysError::Conflict(_, _)));

        remove_user_state(&mut graph, &pool, snapshot, true).unwrap();
        assert!(graph.by_name("rpool/USERDATA/alice_init@ustate1").is_err());
    }

    #[test]
    fn create_user_data_then_change_home() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);

        create_user_data(&mut graph, &pool, &machine, "alice", "/home/alice", "sys1").unwrap();
        let name = format!("rpool/USERDATA/alice_{}", machine.id);
        assert!(graph.by_name(&name).is_ok());

        change_home_on_user_data(&mut graph, &pool, "/home/alice", "/home/alice2").unwrap();
        let dataset = graph.get(graph.by_name(&name).unwrap()).unwrap();
        assert_eq!(dataset.property_value("mountpoint"), Some("/home/alice2"));
    }

    #[test]
    fn dissociate_user_clears_machine_references() {
        let (pool, mut graph) = setup();
        let machine = the_machine(&graph);
        let sys_id = save_system_state(&mut graph, &pool, &machine, Some("sys1".to_string())).unwrap();
        create_user_data(&mut graph, &pool, &machine, "alice", "/home/alice", &sys_id).unwrap();
        let user_dataset = graph.by_name(&format!("rpool/USERDATA/alice_{}", machine.id)).unwrap();

        dissociate_user(&mut graph, &pool, &machine, user_dataset).unwrap();
        assert!(associated_ids(&graph, user_dataset).is_empty());
    }
}

