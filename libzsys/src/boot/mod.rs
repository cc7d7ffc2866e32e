use crate::error::{Result, ZsysError};
use crate::graph::DatasetGraph;
use crate::naming;
use crate::pooladapter::{DatasetKind, PoolAdapter};
use crate::properties;
use crate::state;
use crate::tx::{self, ops};
use chrono::Utc;

/// The fields EnsureBoot/CommitBoot need out of the kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    pub root_dataset: Option<String>,
    pub kernel_image: Option<String>,
}

/// Parse a `/proc/cmdline`-shaped line for `root=ZFS=<dataset>` (or a bare
/// `root=<dataset>`) and the `BOOT_IMAGE=` kernel path.
pub fn parse_cmdline(line: &str) -> KernelCmdline {
    let mut cmdline = KernelCmdline::default();
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("root=") {
            cmdline.root_dataset = Some(value.strip_prefix("ZFS=").unwrap_or(value).to_string());
        } else if let Some(value) = token.strip_prefix("BOOT_IMAGE=") {
            cmdline.kernel_image = Some(value.to_string());
        }
    }
    cmdline
}

/// Ensure the requested root is ready to be mounted: if it names a
/// snapshot, clone it (and its associated user datasets) under a fresh id,
/// then arrange `canmount` so only the intended root auto-mounts. Returns
/// whether any dataset was mutated.
pub fn ensure_boot(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, cmdline: &KernelCmdline) -> Result<bool> {
    let requested = cmdline
        .root_dataset
        .as_ref()
        .ok_or_else(|| ZsysError::Usage("kernel command line has no root= entry".to_string()))?;

    let requested_id = match graph.by_name(requested) {
        Ok(id) => id,
        Err(_) => return Err(ZsysError::NotFound(requested.clone())),
    };
    let requested_dataset = graph.get(requested_id).unwrap();
    let mut changed = false;

    let intended_root = if requested_dataset.kind == DatasetKind::Snapshot {
        let (system_root_name, tag) = requested.split_once('@').unwrap();
        naming::machine_id(system_root_name)
            .ok_or_else(|| ZsysError::IntegrityViolation(format!("{} has no machine id", system_root_name)))?;
        let tag = tag.to_string();
        // A previous EnsureBoot for this same snapshot already cloned it;
        // reuse that clone instead of provisioning a new one every call.
        let existing_clone = requested_dataset.clones().first().copied();

        if let Some(existing_clone) = existing_clone {
            existing_clone
        } else {
            let new_id = naming::generate_id();

            let new_root_name = tx::run(graph, pool, |tx, graph, pool| {
                // Non-recursive over system datasets whose own hierarchy lacks a
                // matching snapshot tag: recursive clone only pulls in the ones
                // that do, which is exactly the set that must move together.
                let new_root_name = ops::clone_dataset(tx, graph, pool, requested, &new_id, false, true)?;

                for user_dataset in state::user_datasets(graph) {
                    let associated = graph
                        .get(user_dataset)
                        .and_then(|d| d.property_value(properties::BOOTFS_DATASETS))
                        .map(properties::split_bootfs_datasets)
                        .unwrap_or_default();
                    if !associated.iter().any(|id| id == &tag) {
                        continue;
                    }
                    let name = graph.get(user_dataset).unwrap().name.to_string();
                    let source_snapshot = format!("{}@{}", name, tag);
                    if graph.find(&source_snapshot).is_some() {
                        let new_id = new_id.clone();
                        tx.nested(graph, pool, move |sub_tx, graph, pool| {
                            let clone_target = ops::clone_dataset(sub_tx, graph, pool, &source_snapshot, &new_id, false, false)?;
                            ops::set_property(
                                sub_tx,
                                graph,
                                pool,
                                &clone_target,
                                properties::BOOTFS_DATASETS,
                                &properties::join_bootfs_datasets(&[new_id.clone()]),
                                true,
                            )
                        })?;
                    }
                }
                Ok(new_root_name)
            })?;

            changed = true;
            graph.by_name(&new_root_name)?
        }
    } else {
        requested_id
    };

    let intended_root_name = graph.get(intended_root).unwrap().name.to_string();
    for (id, dataset) in graph.iter() {
        if dataset.kind != DatasetKind::Filesystem {
            continue;
        }
        if !is_system_dataset_like(&dataset.name) {
            continue;
        }
        let desired = if id == intended_root || dataset.parent().map(|p| p == intended_root).unwrap_or(false) {
            "on"
        } else {
            "noauto"
        };
        let current = dataset.property_value("canmount").unwrap_or("");
        if current != desired {
            pool.set_property(&dataset.name, "canmount", Some(desired))?;
            changed = true;
        }
    }
    if changed {
        pool.set_property(&intended_root_name, "canmount", Some("on"))?;
        graph.refresh(pool)?;
    }

    Ok(changed)
}

fn is_system_dataset_like(name: &str) -> bool {
    name.contains("ROOT")
}

/// Finalize a successfully booted root: repeatedly promote it until its
/// origin is empty, and record `last-used`/`last-booted-kernel`.
pub fn commit_boot(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, mounted_root: &str, cmdline: &KernelCmdline) -> Result<bool> {
    let mut changed = ops::promote_chain(graph, pool, mounted_root)?;

    pool.set_property(mounted_root, properties::LAST_USED, Some(&Utc::now().timestamp().to_string()))?;
    changed = true;
    if let Some(kernel_image) = &cmdline.kernel_image {
        pool.set_property(mounted_root, properties::LAST_BOOTED_KERNEL, Some(kernel_image))?;
    }

    graph.refresh(pool)?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_and_kernel_image() {
        let cmdline = parse_cmdline("BOOT_IMAGE=/vmlinuz-5.4.0 root=ZFS=rpool/ROOT/ubuntu_init ro quiet");
        assert_eq!(cmdline.root_dataset.as_deref(), Some("rpool/ROOT/ubuntu_init"));
        assert_eq!(cmdline.kernel_image.as_deref(), Some("/vmlinuz-5.4.0"));
    }

    #[test]
    fn parses_bare_root_without_zfs_prefix() {
        let cmdline = parse_cmdline("root=/dev/sda1 ro");
        assert_eq!(cmdline.root_dataset.as_deref(), Some("/dev/sda1"));
    }
}
