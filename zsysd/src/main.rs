use anyhow::Result;
use clap::{crate_version, Clap};
use libzsys::authz::AllowAllAuthorizer;
use libzsys::config::DaemonConfig;
use libzsys::pooladapter::zfs::ZfsPoolAdapter;
use slog::{info, Logger};
use std::sync::Arc;
use zsysd::server;
use zsysd::state::AppState;

/// Minimal CLI surface for picking the socket path and verbosity. Full
/// subcommand wiring, man pages and shell completions are out of scope.
#[derive(Clap)]
#[clap(version = crate_version!(), author = "zsys maintainers")]
struct CliOptions {
    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Override the request socket path (defaults to ZSYSD_SOCKET_PATH or
    /// the daemon's built-in default).
    #[clap(long)]
    socket_path: Option<String>,
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
    let mut config = DaemonConfig::from_env().unwrap_or_default();
    if let Some(socket_path) = options.socket_path {
        config.socket_path = socket_path;
    }

    let pool = Arc::new(ZfsPoolAdapter::new());
    let state = Arc::new(AppState::new(pool, config.clone(), log.clone())?);
    let authorizer: Arc<dyn libzsys::authz::Authorizer> = Arc::new(AllowAllAuthorizer);

    info!(log, "listening"; "socket_path" => &config.socket_path);
    let listener = server::bind(&config.socket_path)?;
    server::serve(state, authorizer, listener).await?;
    Ok(())
}
