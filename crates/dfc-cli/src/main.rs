mod claim;
mod context;
mod state;
mod sync;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dfc", version, about = "Coordination CLI for decompilation agent fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim functions so agents do not collide on the same work.
    #[command(subcommand)]
    Claim(claim::ClaimCommand),
    /// Lock shared source subdirectories for exclusive commits.
    #[command(subcommand)]
    Lock(claim::LockCommand),
    /// Read and update per-function coordination state.
    #[command(subcommand)]
    State(state::StateCommand),
    /// Fold externally computed facts into the store.
    #[command(subcommand)]
    Sync(sync::SyncCommand),
    /// Query the append-only change ledger.
    #[command(subcommand)]
    Audit(state::AuditCommand),
    /// Fleet agent registry.
    #[command(subcommand)]
    Agent(state::AgentCommand),
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Claim(command) => claim::handle_claim_command(command),
        Commands::Lock(command) => claim::handle_lock_command(command),
        Commands::State(command) => state::handle_state_command(command),
        Commands::Sync(command) => sync::handle_sync_command(command),
        Commands::Audit(command) => state::handle_audit_command(command),
        Commands::Agent(command) => state::handle_agent_command(command),
    }
}

/// Logs go to stderr so `--json` output stays parseable on stdout.
fn init_logging() {
    let level = if let Ok(level) = std::env::var("DFC_LOG") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
