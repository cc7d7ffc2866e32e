mod client;
mod commands;
mod ui;

use anyhow::Result;
use clap::{crate_version, Clap};
use slog::Logger;

/// Thin client for zsysd. Every subcommand encodes one RPC request, sends it
/// over the daemon's Unix socket, and streams back the daemon's own log
/// lines before printing the result.
#[derive(Clap)]
#[clap(version = crate_version!(), author = "zsys maintainers")]
struct CliOptions {
    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences), global = true)]
    verbose: usize,

    /// Override the daemon socket path (defaults to ZSYSD_SOCKET_PATH or the
    /// daemon's built-in default).
    #[clap(long, global = true)]
    socket_path: Option<String>,

    #[clap(subcommand)]
    command: TopCommand,
}

#[derive(Clap)]
enum TopCommand {
    /// Save the current state of the system dataset as a new, immutable
    /// system state.
    SaveSystemState {
        #[clap(long, default_value = "init")]
        machine_id: String,
    },
    /// Save the current state of a user dataset as a new user state.
    SaveUserState {
        #[clap(long, default_value = "init")]
        machine_id: String,
        user: String,
    },
    /// Remove a system state. Prompts for confirmation unless `--yes` is
    /// given; the first call is a dry run that reports what else would be
    /// removed.
    RemoveSystemState {
        #[clap(long, default_value = "init")]
        machine_id: String,
        state_id: String,
        #[clap(long)]
        yes: bool,
    },
    /// Remove a user state.
    RemoveUserState {
        #[clap(long, default_value = "init")]
        machine_id: String,
        user: String,
        state_id: String,
        #[clap(long)]
        force: bool,
    },
    /// Dissociate a user dataset from a machine, keeping the dataset itself.
    DissociateUser {
        #[clap(long, default_value = "init")]
        machine_id: String,
        user: String,
    },
    /// Create a new user dataset under a machine's USERDATA pool.
    CreateUserData {
        #[clap(long, default_value = "init")]
        machine_id: String,
        user: String,
        home: String,
    },
    /// Move a user dataset's home directory to a new path.
    ChangeHome { home: String, new_home: String },
    /// Ensure the dataset the kernel booted from is ready to be mounted.
    EnsureBoot,
    /// Commit a successful boot: promote the booted dataset chain and
    /// record it as the newest last-used state.
    CommitBoot { mounted_root: String },
    /// Apply the retention policy, removing old system states.
    Gc {
        #[clap(long, default_value = "init")]
        machine_id: String,
    },
}

fn main() {
    match CliOptions::try_parse() {
        Ok(options) => {
            let verbose = options.verbose;
            zsysapp::zsysapp_run(|log| async_main(log, options), verbose);
        }
        Err(e) => {
            let message = e.to_string();
            println!("{}", message.replace("error:", "ERRO:"));
            std::process::exit(2);
        }
    }
}

async fn async_main(log: Logger, options: CliOptions) -> Result<()> {
    let config = libzsys::config::DaemonConfig::from_env().unwrap_or_default();
    let socket_path = options.socket_path.unwrap_or(config.socket_path);

    match options.command {
        TopCommand::SaveSystemState { machine_id } => {
            commands::save_system_state(&socket_path, &log, machine_id).await
        }
        TopCommand::SaveUserState { machine_id, user } => {
            commands::save_user_state(&socket_path, &log, machine_id, user).await
        }
        TopCommand::RemoveSystemState { machine_id, state_id, yes } => {
            commands::remove_system_state(&socket_path, &log, machine_id, state_id, yes).await
        }
        TopCommand::RemoveUserState { machine_id, user, state_id, force } => {
            commands::remove_user_state(&socket_path, &log, machine_id, user, state_id, force).await
        }
        TopCommand::DissociateUser { machine_id, user } => {
            commands::dissociate_user(&socket_path, &log, machine_id, user).await
        }
        TopCommand::CreateUserData { machine_id, user, home } => {
            commands::create_user_data(&socket_path, &log, machine_id, user, home).await
        }
        TopCommand::ChangeHome { home, new_home } => {
            commands::change_home(&socket_path, &log, home, new_home).await
        }
        TopCommand::EnsureBoot => commands::ensure_boot(&socket_path, &log).await,
        TopCommand::CommitBoot { mounted_root } => {
            commands::commit_boot(&socket_path, &log, mounted_root).await
        }
        TopCommand::Gc { machine_id } => commands::gc(&socket_path, &log, machine_id).await,
    }
}
