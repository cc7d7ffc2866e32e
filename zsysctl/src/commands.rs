use crate::ui;
use anyhow::Result;
use comfy_table::Cell;
use slog::Logger;
use zsysd::rpc::{Request, ResultRecord};

async fn dispatch(socket_path: &str, log: &Logger, request: Request) -> Result<serde_json::Value> {
    match crate::client::call(socket_path, log, &request).await? {
        ResultRecord::Ok { detail } => Ok(detail),
        ResultRecord::Err { kind, message } => {
            anyhow::bail!("{:?}: {}", kind, message)
        }
    }
}

pub async fn save_system_state(socket_path: &str, log: &Logger, machine_id: String) -> Result<()> {
    let detail = dispatch(socket_path, log, Request::SaveSystemState { machine_id }).await?;
    print_state_id(&detail);
    Ok(())
}

pub async fn save_user_state(socket_path: &str, log: &Logger, machine_id: String, user: String) -> Result<()> {
    let detail = dispatch(socket_path, log, Request::SaveUserState { machine_id, user }).await?;
    print_state_id(&detail);
    Ok(())
}

pub async fn remove_system_state(socket_path: &str, log: &Logger, machine_id: String, state_id: String, yes: bool) -> Result<()> {
    let plan = dispatch(
        socket_path,
        log,
        Request::RemoveSystemState {
            machine_id: machine_id.clone(),
            state_id: state_id.clone(),
            force: false,
        },
    )
    .await?;
    let collateral = collect_strings(&plan, "collateral");
    let forced = collect_strings(&plan, "forced");
    if !yes && !ui::confirm_removal(&collateral, &forced)? {
        println!("aborted");
        return Ok(());
    }
    dispatch(
        socket_path,
        log,
        Request::RemoveSystemState {
            machine_id,
            state_id,
            force: true,
        },
    )
    .await?;
    println!("removed");
    Ok(())
}

pub async fn remove_user_state(socket_path: &str, log: &Logger, machine_id: String, user: String, state_id: String, force: bool) -> Result<()> {
    dispatch(
        socket_path,
        log,
        Request::RemoveUserState {
            machine_id,
            user,
            state_id,
            force,
        },
    )
    .await?;
    println!("removed");
    Ok(())
}

pub async fn dissociate_user(socket_path: &str, log: &Logger, machine_id: String, user: String) -> Result<()> {
    dispatch(socket_path, log, Request::DissociateUser { machine_id, user }).await?;
    println!("dissociated");
    Ok(())
}

pub async fn create_user_data(socket_path: &str, log: &Logger, machine_id: String, user: String, home: String) -> Result<()> {
    dispatch(socket_path, log, Request::CreateUserData { machine_id, user, home }).await?;
    println!("created");
    Ok(())
}

pub async fn change_home(socket_path: &str, log: &Logger, home: String, new_home: String) -> Result<()> {
    dispatch(socket_path, log, Request::ChangeHome { home, new_home }).await?;
    println!("updated");
    Ok(())
}

pub async fn ensure_boot(socket_path: &str, log: &Logger) -> Result<()> {
    let detail = dispatch(socket_path, log, Request::EnsureBoot).await?;
    print_changed(&detail);
    Ok(())
}

pub async fn commit_boot(socket_path: &str, log: &Logger, mounted_root: String) -> Result<()> {
    let detail = dispatch(socket_path, log, Request::CommitBoot { mounted_root }).await?;
    print_changed(&detail);
    Ok(())
}

pub async fn gc(socket_path: &str, log: &Logger, machine_id: String) -> Result<()> {
    let detail = dispatch(socket_path, log, Request::Gc { machine_id }).await?;
    let removed = collect_strings(&detail, "removed");
    ui::print_comfy_info(vec![(
        ui::comfy_identifier_header("removed"),
        ui::comfy_name_value(removed.join(", ")),
    )]);
    Ok(())
}

fn print_state_id(detail: &serde_json::Value) {
    let id = detail.get("state_id").and_then(|v| v.as_str()).unwrap_or("");
    ui::print_comfy_info(vec![(ui::comfy_identifier_header("state id"), Cell::new(id))]);
}

fn print_changed(detail: &serde_json::Value) {
    let changed = detail.get("changed").and_then(|v| v.as_bool()).unwrap_or(false);
    ui::print_comfy_info(vec![(ui::comfy_identifier_header("changed"), Cell::new(changed))]);
}

fn collect_strings(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}
