//! `dfc claim` and `dfc lock`: the contention-facing commands. Refusals are
//! printed, not raised, and exit non-zero so scripts can branch on them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use dfc_core::workspace::{worktree_dir_name, BROKEN_BUILD_CLAIM_THRESHOLD};
use dfc_core::{ClaimOutcome, LockOutcome, ReleaseOutcome, SubdirectoryLock, UnlockOutcome};
use serde_json::json;

use crate::context::CliContext;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum ClaimCommand {
    /// Claim a function for this agent.
    Add(ClaimAddArgs),
    /// Release a claimed function.
    Release(ClaimReleaseArgs),
    /// List active claims across the fleet.
    List(ClaimListArgs),
}

#[derive(Args, Debug)]
pub struct ClaimAddArgs {
    /// Function to claim.
    pub function_name: String,
    #[arg(long)]
    pub agent: Option<String>,
    /// Source file the function lives in; routes the claim through the
    /// owning workspace lock.
    #[arg(long)]
    pub source_file: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ClaimReleaseArgs {
    /// Function to release.
    pub function_name: String,
    #[arg(long)]
    pub agent: Option<String>,
    /// Release even when the lease belongs to another agent.
    #[arg(long)]
    pub force: bool,
    /// Also release the owning workspace lock.
    #[arg(long)]
    pub release_subdir: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ClaimListArgs {
    /// Only show claims held by this agent.
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub json: bool,
}

pub fn handle_claim_command(command: ClaimCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        ClaimCommand::Add(args) => add_claim(&ctx, &args),
        ClaimCommand::Release(args) => release_claim(&ctx, &args),
        ClaimCommand::List(args) => list_claims(&ctx, &args),
    }
}

fn add_claim(ctx: &CliContext, args: &ClaimAddArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());
    let now = Utc::now();
    let subdirectory = args
        .source_file
        .as_deref()
        .map(|path| ctx.subdirectory_for(path));

    let mut store = ctx.open_store()?;
    let outcome = store.add_claim(
        &args.function_name,
        &agent,
        subdirectory.as_deref(),
        ctx.claim_ttl_secs,
        now,
    )?;

    let (renewed, expires_at) = match &outcome {
        ClaimOutcome::Acquired { expires_at } => (false, *expires_at),
        ClaimOutcome::AlreadyYours { expires_at } => (true, *expires_at),
        ClaimOutcome::HeldByOther { holder, expires_at } => {
            if args.json {
                let mut payload = serde_json::to_value(&outcome)?;
                payload["function"] = json!(args.function_name);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "'{}' is claimed by {} until {}",
                    args.function_name,
                    holder,
                    fmt_when(*expires_at)
                );
                println!("Pick a function nobody is holding.");
            }
            std::process::exit(1);
        }
        ClaimOutcome::WorkspaceUnhealthy {
            workspace,
            broken_functions,
        } => {
            if args.json {
                let mut payload = serde_json::to_value(&outcome)?;
                payload["function"] = json!(args.function_name);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "Workspace '{}' has {} broken builds; fix one before claiming more work:",
                    workspace,
                    broken_functions.len()
                );
                for name in broken_functions {
                    println!("  {name}");
                }
            }
            std::process::exit(1);
        }
    };

    if let Some(key) = subdirectory.as_deref() {
        let lock = store.lock_subdirectory(key, &agent, ctx.lock_ttl_mins, now)?;
        if let LockOutcome::HeldByOther { holder, expires_at } = lock {
            // A lease without its workspace is useless; hand it back.
            store.release_claim(&args.function_name, Some(&agent), now)?;
            if args.json {
                let payload = json!({
                    "result": "subdirectory_locked",
                    "function": args.function_name,
                    "subdirectory": key,
                    "holder": holder,
                    "expires_at": expires_at,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "Subdirectory '{key}' is locked by {holder} until {}",
                    fmt_when(expires_at)
                );
                println!("Pick a function in a different subdirectory, or wait for the lock to expire.");
            }
            std::process::exit(1);
        }
    }

    // Legacy readers learn about the claim after the store does; a torn
    // moment between the two reads as a lag, never a phantom claim.
    ctx.mirror().record(
        &args.function_name,
        &agent,
        args.source_file.as_deref(),
        subdirectory.as_deref(),
        now,
    )?;

    if args.json {
        let mut payload = serde_json::to_value(&outcome)?;
        payload["function"] = json!(args.function_name);
        payload["agent"] = json!(agent);
        if let Some(key) = &subdirectory {
            payload["subdirectory"] = json!(key);
            payload["worktree"] = json!(worktree_dir_name(key));
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        if renewed {
            println!(
                "Already claimed by you; lease runs to {}",
                fmt_when(expires_at)
            );
        } else {
            println!(
                "Claimed: {} (expires {})",
                args.function_name,
                fmt_when(expires_at)
            );
        }
        if let Some(key) = &subdirectory {
            println!("Subdirectory: {key}");
            println!("Worktree: {}/", worktree_dir_name(key));
        }
    }
    Ok(())
}

fn release_claim(ctx: &CliContext, args: &ClaimReleaseArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());
    let now = Utc::now();
    let owner = if args.force {
        None
    } else {
        Some(agent.as_str())
    };

    let mut store = ctx.open_store()?;
    let outcome = store.release_claim(&args.function_name, owner, now)?;

    if let ReleaseOutcome::NotOwner { holder } = &outcome {
        if args.json {
            let mut payload = serde_json::to_value(&outcome)?;
            payload["function"] = json!(args.function_name);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            println!(
                "'{}' is claimed by {holder}; use --force to release it anyway",
                args.function_name
            );
        }
        std::process::exit(1);
    }

    // Drop the legacy entry even when the store had no lease; a stale
    // mirror line should not outlive the release that targets it.
    let dropped = ctx.mirror().remove(&args.function_name, now)?;
    let subdirectory = match dropped.and_then(|entry| entry.subdirectory) {
        Some(key) => Some(key),
        None => store
            .get_function(&args.function_name)?
            .and_then(|record| record.source_file_path)
            .map(|path| ctx.subdirectory_for(&path)),
    };

    let mut subdirectory_released = false;
    if args.release_subdir {
        if let Some(key) = subdirectory.as_deref() {
            match store.unlock_subdirectory(key, owner, now)? {
                UnlockOutcome::Unlocked => subdirectory_released = true,
                UnlockOutcome::NotOwner { holder } => {
                    if !args.json {
                        println!("Subdirectory '{key}' is locked by {holder}; left in place");
                    }
                }
            }
        }
    }

    if args.json {
        let mut payload = serde_json::to_value(&outcome)?;
        payload["function"] = json!(args.function_name);
        if let Some(key) = &subdirectory {
            payload["subdirectory"] = json!(key);
            payload["subdirectory_released"] = json!(subdirectory_released);
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    match &outcome {
        ReleaseOutcome::Released { .. } => println!("Released: {}", args.function_name),
        ReleaseOutcome::NotClaimed => println!("No active lease on '{}'", args.function_name),
        ReleaseOutcome::NotOwner { .. } => {}
    }
    if let Some(key) = &subdirectory {
        if subdirectory_released {
            println!("Released subdirectory lock: {key}");
        } else if !args.release_subdir {
            println!("Subdirectory still locked: {key}");
            println!("Use --release-subdir to also release the subdirectory lock");
        }
    }
    Ok(())
}

fn list_claims(ctx: &CliContext, args: &ClaimListArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let now = Utc::now();
    let mut claims = store.get_active_claims(now)?;
    if let Some(agent) = &args.agent {
        claims.retain(|claim| claim.agent_id == *agent);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&claims)?);
        return Ok(());
    }
    if claims.is_empty() {
        println!("No active claims.");
        return Ok(());
    }
    for claim in &claims {
        let match_part = claim
            .match_percent
            .map(|pct| format!("  {pct:.1}%"))
            .unwrap_or_default();
        println!(
            "{:<40} {:<20} {:>4.0}m left{}",
            claim.function_name, claim.agent_id, claim.minutes_remaining, match_part
        );
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum LockCommand {
    /// Take or extend a workspace lock.
    Acquire(LockAcquireArgs),
    /// Release a workspace lock.
    Release(LockReleaseArgs),
    /// Show lock state, fleet-wide or for one workspace.
    Status(LockStatusArgs),
}

#[derive(Args, Debug)]
pub struct LockAcquireArgs {
    /// Workspace key, or a source path to derive it from.
    pub subdirectory: String,
    #[arg(long)]
    pub agent: Option<String>,
    /// Lock lifetime in minutes.
    #[arg(long)]
    pub ttl_mins: Option<i64>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LockReleaseArgs {
    /// Workspace key, or a source path to derive it from.
    pub subdirectory: String,
    #[arg(long)]
    pub agent: Option<String>,
    /// Release even when the lock belongs to another agent.
    #[arg(long)]
    pub force: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LockStatusArgs {
    /// Workspace key, or a source path to derive it from.
    pub subdirectory: Option<String>,
    #[arg(long)]
    pub json: bool,
}

pub fn handle_lock_command(command: LockCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        LockCommand::Acquire(args) => acquire_lock(&ctx, &args),
        LockCommand::Release(args) => release_lock(&ctx, &args),
        LockCommand::Status(args) => lock_status(&ctx, &args),
    }
}

fn acquire_lock(ctx: &CliContext, args: &LockAcquireArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());
    let now = Utc::now();
    let key = ctx.workspace_key(&args.subdirectory);
    let ttl_mins = args.ttl_mins.unwrap_or(ctx.lock_ttl_mins);

    let mut store = ctx.open_store()?;
    let outcome = store.lock_subdirectory(&key, &agent, ttl_mins, now)?;

    if args.json {
        let mut payload = serde_json::to_value(&outcome)?;
        payload["subdirectory"] = json!(key);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        if !outcome.succeeded() {
            std::process::exit(1);
        }
        return Ok(());
    }

    match &outcome {
        LockOutcome::Acquired { expires_at } => {
            println!("Locked '{key}' until {}", fmt_when(*expires_at));
        }
        LockOutcome::Extended { expires_at } => {
            println!("Extended '{key}' until {}", fmt_when(*expires_at));
        }
        LockOutcome::HeldByOther { holder, expires_at } => {
            println!(
                "'{key}' is locked by {holder} until {}",
                fmt_when(*expires_at)
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

fn release_lock(ctx: &CliContext, args: &LockReleaseArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());
    let now = Utc::now();
    let key = ctx.workspace_key(&args.subdirectory);
    let owner = if args.force {
        None
    } else {
        Some(agent.as_str())
    };

    let mut store = ctx.open_store()?;
    let outcome = store.unlock_subdirectory(&key, owner, now)?;

    if args.json {
        let mut payload = serde_json::to_value(&outcome)?;
        payload["subdirectory"] = json!(key);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        if !outcome.succeeded() {
            std::process::exit(1);
        }
        return Ok(());
    }

    match &outcome {
        UnlockOutcome::Unlocked => println!("Unlocked '{key}'"),
        UnlockOutcome::NotOwner { holder } => {
            println!("'{key}' is locked by {holder}; use --force to release it anyway");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn lock_status(ctx: &CliContext, args: &LockStatusArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let now = Utc::now();

    if let Some(raw) = &args.subdirectory {
        let key = ctx.workspace_key(raw);
        let lock = store.get_subdirectory_lock(&key)?;
        let broken = store.subdirectory_broken_functions(&key)?;

        if args.json {
            let payload = json!({ "lock": lock, "broken_functions": broken });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            return Ok(());
        }

        match &lock {
            Some(lock) => print_lock_line(lock, now),
            None => println!("No workspace on record for '{key}'."),
        }
        if !broken.is_empty() {
            println!("Broken builds ({}):", broken.len());
            for name in &broken {
                println!("  {name}");
            }
            if broken.len() >= BROKEN_BUILD_CLAIM_THRESHOLD {
                println!("New claims into this workspace are refused until one is fixed.");
            }
        }
        return Ok(());
    }

    let locks = store.get_subdirectory_status()?;
    let broken = store.all_broken_builds()?;

    if args.json {
        let payload = json!({ "locks": locks, "broken_builds": broken });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if locks.is_empty() {
        println!("No workspaces on record.");
    } else {
        for lock in &locks {
            print_lock_line(lock, now);
        }
    }
    if !broken.is_empty() {
        println!("Broken builds ({}):", broken.len());
        for entry in &broken {
            let worktree = entry.worktree_path.as_deref().unwrap_or("-");
            println!("  {:<40} {worktree}", entry.function_name);
        }
    }
    Ok(())
}

fn print_lock_line(lock: &SubdirectoryLock, now: DateTime<Utc>) {
    match (lock.holder(now), lock.lock_expires_at) {
        (Some(holder), Some(expires_at)) => println!(
            "{:<28} locked by {holder} until {}",
            lock.subdirectory_key,
            fmt_when(expires_at)
        ),
        _ => println!(
            "{:<28} free ({} pending commits)",
            lock.subdirectory_key, lock.pending_commits
        ),
    }
}

pub(crate) fn fmt_when(when: DateTime<Utc>) -> String {
    when.format("%Y-%m-%d %H:%M UTC").to_string()
}
