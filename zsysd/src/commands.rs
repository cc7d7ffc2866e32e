use crate::rpc::Request;
use crate::state::AppState;
use libzsys::authz::{Authorizer, PeerCredential, PolicyAction};
use libzsys::boot::{self, KernelCmdline};
use libzsys::error::{Result, ZsysError};
use libzsys::gc::{self, RetentionPolicy};
use libzsys::graph::{DatasetGraph, DatasetId};
use libzsys::state::{self, Machine};
use slog::{info, Logger};

/// Dispatch one decoded request against the shared state. Pool-mutating
/// calls run under `mutation_lock` for the whole call, serializing every
/// call that reaches the Pool Adapter process-wide. `log` is this
/// connection's own logger, already wired to stream lines back to the
/// caller, so handlers log to it directly rather than through the
/// process-global `slog_scope` logger that the deeper library calls use for
/// their own (daemon-local-only) diagnostics.
pub async fn dispatch(state: &AppState, authorizer: &dyn Authorizer, peer: PeerCredential, log: &Logger, request: Request) -> Result<serde_json::Value> {
    match request {
        Request::SaveSystemState { machine_id } => {
            authorizer.check(peer, PolicyAction::ManageSystemState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let id = state::save_system_state(&mut graph, state.pool.as_ref(), &machine, None)?;
            info!(log, "saved system state {}", id);
            Ok(serde_json::json!({ "state_id": id }))
        }

        Request::SaveUserState { machine_id, user } => {
            authorizer.check(peer, user_action(&peer, &user))?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let user_dataset = find_user_dataset(&graph, &machine, &user)?;
            let id = state::save_user_state(&mut graph, state.pool.as_ref(), user_dataset, &machine.id, None)?;
            info!(log, "saved user state {} for {}", id, user);
            Ok(serde_json::json!({ "state_id": id }))
        }

        Request::RemoveSystemState { machine_id, state_id, force } => {
            authorizer.check(peer, PolicyAction::ManageSystemState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let plan = state::remove_system_state(&mut graph, state.pool.as_ref(), &machine, &state_id, force)?;
            if !force && !plan.is_empty() {
                info!(log, "{}", plan);
            }
            Ok(serde_json::json!({ "collateral": plan.collateral, "forced": plan.forced, "applied": force }))
        }

        Request::RemoveUserState { machine_id, user, state_id, force } => {
            authorizer.check(peer, user_action(&peer, &user))?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let user_dataset = find_user_dataset(&graph, &machine, &user)?;
            let snapshot_name = format!("{}@{}", graph.get(user_dataset).unwrap().name, state_id);
            let snapshot = graph.by_name(&snapshot_name).map_err(|_| ZsysError::NotFound(snapshot_name))?;
            state::remove_user_state(&mut graph, state.pool.as_ref(), snapshot, force)?;
            Ok(serde_json::json!({}))
        }

        Request::DissociateUser { machine_id, user } => {
            authorizer.check(peer, user_action(&peer, &user))?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let user_dataset = find_user_dataset(&graph, &machine, &user)?;
            state::dissociate_user(&mut graph, state.pool.as_ref(), &machine, user_dataset)?;
            Ok(serde_json::json!({}))
        }

        Request::CreateUserData { machine_id, user, home } => {
            authorizer.check(peer, user_action(&peer, &user))?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let current = machine.id.clone();
            state::create_user_data(&mut graph, state.pool.as_ref(), &machine, &user, &home, &current)?;
            Ok(serde_json::json!({}))
        }

        Request::ChangeHome { home, new_home } => {
            authorizer.check(peer, PolicyAction::ManageOwnUserState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            state::change_home_on_user_data(&mut graph, state.pool.as_ref(), &home, &new_home)?;
            Ok(serde_json::json!({}))
        }

        Request::EnsureBoot => {
            authorizer.check(peer, PolicyAction::ManageSystemState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let cmdline = read_cmdline().await?;
            let changed = boot::ensure_boot(&mut graph, state.pool.as_ref(), &cmdline)?;
            info!(log, "ensure boot: changed={}", changed);
            Ok(serde_json::json!({ "changed": changed }))
        }

        Request::CommitBoot { mounted_root } => {
            authorizer.check(peer, PolicyAction::ManageSystemState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let cmdline = read_cmdline().await?;
            let changed = boot::commit_boot(&mut graph, state.pool.as_ref(), &mounted_root, &cmdline)?;
            info!(log, "commit boot for {}: changed={}", mounted_root, changed);
            Ok(serde_json::json!({ "changed": changed }))
        }

        Request::Gc { machine_id } => {
            authorizer.check(peer, PolicyAction::ManageSystemState)?;
            let _guard = state.mutation_lock.lock().await;
            let mut graph = state.graph.write().await;
            let machine = find_machine(&graph, &machine_id)?;
            let removed = gc::collect(&mut graph, state.pool.as_ref(), &machine, None, &RetentionPolicy::default())?;
            info!(log, "gc removed {} state(s)", removed.len());
            Ok(serde_json::json!({ "removed": removed }))
        }
    }
}

fn user_action(peer: &PeerCredential, _user: &str) -> PolicyAction {
    // Resolving `_user` to a uid to compare against `peer.uid` is the
    // policy-engine bridge's job; it is out of scope here. Root always acts
    // on its own behalf, everyone else is treated as touching someone
    // else's state so `DenyNonRootAuthorizer` still exercises that path.
    if peer.uid == 0 {
        PolicyAction::ManageOwnUserState
    } else {
        PolicyAction::ManageOtherUserState
    }
}

fn find_machine(graph: &DatasetGraph, machine_id: &str) -> Result<Machine> {
    state::find_machines(graph)
        .into_iter()
        .find(|m| m.id == machine_id)
        .ok_or_else(|| ZsysError::NotFound(format!("machine {}", machine_id)))
}

fn find_user_dataset(graph: &DatasetGraph, machine: &Machine, user: &str) -> Result<DatasetId> {
    let suffix = format!("/{}_{}", user, machine.id);
    state::user_datasets(graph)
        .into_iter()
        .find(|&id| graph.get(id).map(|d| d.name.ends_with(&suffix)).unwrap_or(false))
        .ok_or_else(|| ZsysError::NotFound(format!("user dataset for {} on machine {}", user, machine.id)))
}

async fn read_cmdline() -> Result<KernelCmdline> {
    let contents = tokio::fs::read_to_string("/proc/cmdline")
        .await
        .map_err(|err| ZsysError::IntegrityViolation(format!("reading /proc/cmdline: {}", err)))?;
    Ok(boot::parse_cmdline(contents.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use libzsys::authz::AllowAllAuthorizer;
    use libzsys::config::DaemonConfig;
    use libzsys::pooladapter::mock::MemoryPoolAdapter;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/ubuntu_init").unwrap();
        pool.set_property("rpool/ROOT/ubuntu_init", "com.ubuntu.zsys:bootfs", Some("yes"))
            .unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        AppState::new(Arc::new(pool), DaemonConfig::default(), log).unwrap()
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn save_system_state_returns_a_state_id() {
        let state = test_state();
        let authorizer = AllowAllAuthorizer;
        let peer = PeerCredential { uid: 0, pid: 1 };
        let request = Request::SaveSystemState { machine_id: "init".to_string() };
        let result = dispatch(&state, &authorizer, peer, &test_log(), request).await.unwrap();
        assert!(result["state_id"].is_string());
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let state = test_state();
        let authorizer = AllowAllAuthorizer;
        let peer = PeerCredential { uid: 0, pid: 1 };
        let request = Request::SaveSystemState { machine_id: "nope".to_string() };
        let err = dispatch(&state, &authorizer, peer, &test_log(), request).await.unwrap_err();
        assert!(matches!(err, ZsysError::NotFound(_)));
    }

    #[tokio::test]
    async fn deny_non_root_blocks_system_state_changes() {
        use libzsys::authz::DenyNonRootAuthorizer;
        let state = test_state();
        let authorizer = DenyNonRootAuthorizer;
        let peer = PeerCredential { uid: 1000, pid: 1 };
        let request = Request::SaveSystemState { machine_id: "init".to_string() };
        let err = dispatch(&state, &authorizer, peer, &test_log(), request).await.unwrap_err();
        assert!(matches!(err, ZsysError::PermissionDenied(_)));
    }
}
