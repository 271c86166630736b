//! `dfc state`, `dfc audit`, and `dfc agent`: reading and writing the
//! function ledger directly.

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use dfc_core::audit::EntityKind;
use dfc_core::identity::normalize_address;
use dfc_core::{FunctionPatch, FunctionRecord};
use serde_json::json;

use crate::claim::fmt_when;
use crate::context::CliContext;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum StateCommand {
    /// Update fields on a function record.
    Set(StateSetArgs),
    /// Show one function, found by name or address.
    Show(StateShowArgs),
    /// List tracked functions.
    List(StateListArgs),
    /// High matches that never landed in git.
    Uncommitted(StateUncommittedArgs),
    /// Verification timestamps older than a threshold.
    Stale(StateStaleArgs),
}

#[derive(Args, Debug)]
pub struct StateSetArgs {
    pub function_name: String,
    #[arg(long)]
    pub agent: Option<String>,
    /// Lifecycle status: unclaimed, claimed, in_progress, matched,
    /// committed, committed_needs_fix, in_review, merged.
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub match_percent: Option<f64>,
    /// Build health: passing or broken.
    #[arg(long)]
    pub build_status: Option<String>,
    #[arg(long)]
    pub build_diagnosis: Option<String>,
    #[arg(long)]
    pub docs_status: Option<String>,
    #[arg(long)]
    pub source_file: Option<String>,
    #[arg(long)]
    pub local_slug: Option<String>,
    #[arg(long)]
    pub production_slug: Option<String>,
    /// Pass `true` or `false`.
    #[arg(long)]
    pub committed: Option<bool>,
    #[arg(long)]
    pub commit_hash: Option<String>,
    #[arg(long)]
    pub branch: Option<String>,
    #[arg(long)]
    pub worktree_path: Option<String>,
    /// Address in any accepted spelling; stored canonically.
    #[arg(long)]
    pub address: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StateShowArgs {
    /// Function name or address.
    pub function: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StateListArgs {
    /// Only functions in this status.
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StateUncommittedArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StateStaleArgs {
    /// Hours since last verification.
    #[arg(long, default_value_t = 24.0)]
    pub min_hours: f64,
    #[arg(long)]
    pub json: bool,
}

pub fn handle_state_command(command: StateCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        StateCommand::Set(args) => set_state(&ctx, &args),
        StateCommand::Show(args) => show_state(&ctx, &args),
        StateCommand::List(args) => list_state(&ctx, &args),
        StateCommand::Uncommitted(args) => list_uncommitted(&ctx, &args),
        StateCommand::Stale(args) => list_stale(&ctx, &args),
    }
}

fn set_state(ctx: &CliContext, args: &StateSetArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());

    let mut patch = FunctionPatch::default();
    if let Some(raw) = &args.status {
        patch.status = Some(raw.parse().map_err(anyhow::Error::msg)?);
    }
    if let Some(percent) = args.match_percent {
        patch.match_percent = Some(percent);
    }
    if let Some(raw) = &args.build_status {
        patch.build_status = Some(raw.parse().map_err(anyhow::Error::msg)?);
    }
    if let Some(diagnosis) = &args.build_diagnosis {
        patch.build_diagnosis = Some(diagnosis.clone());
    }
    if let Some(raw) = &args.docs_status {
        patch.documentation_status = Some(raw.parse().map_err(anyhow::Error::msg)?);
    }
    if let Some(path) = &args.source_file {
        patch.source_file_path = Some(path.clone());
    }
    if let Some(slug) = &args.local_slug {
        patch.local_scratch_slug = Some(slug.clone());
    }
    if let Some(slug) = &args.production_slug {
        patch.production_scratch_slug = Some(slug.clone());
    }
    if let Some(committed) = args.committed {
        patch.is_committed = Some(committed);
    }
    if let Some(hash) = &args.commit_hash {
        patch.commit_hash = Some(hash.clone());
    }
    if let Some(branch) = &args.branch {
        patch.branch = Some(branch.clone());
    }
    if let Some(path) = &args.worktree_path {
        patch.worktree_path = Some(path.clone());
    }
    if let Some(raw) = &args.address {
        match normalize_address(raw) {
            Some(canonical) => patch.canonical_address = Some(canonical),
            None => bail!("address '{raw}' does not parse"),
        }
    }
    if let Some(notes) = &args.notes {
        patch.notes = Some(notes.clone());
    }
    if patch.is_empty() {
        bail!("nothing to set; pass at least one field flag");
    }

    let mut store = ctx.open_store()?;
    store.upsert_function(&args.function_name, &patch, Some(&agent), Utc::now())?;
    let record = store.get_function(&args.function_name)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    println!("Updated: {}", args.function_name);
    if let Some(record) = &record {
        print_function_line(record);
    }
    Ok(())
}

fn show_state(ctx: &CliContext, args: &StateShowArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let record =
        store.get_function_by_name_or_address(Some(&args.function), Some(&args.function))?;

    let Some(record) = record else {
        println!("No record for '{}'", args.function);
        return Ok(());
    };

    let aliases = match &record.canonical_address {
        Some(address) => store.get_aliases_for_address(address)?,
        None => Vec::new(),
    };
    let claim = store.get_claim(&record.function_name)?;

    if args.json {
        let payload = json!({ "function": record, "aliases": aliases, "claim": claim });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("{}", record.function_name);
    if let Some(address) = &record.canonical_address {
        println!("  address:     {address}");
    }
    println!("  status:      {}", record.status);
    println!("  match:       {:.1}%", record.match_percent);
    if let Some(build) = record.build_status {
        println!("  build:       {build}");
        if let Some(diagnosis) = &record.build_diagnosis {
            println!("  diagnosis:   {diagnosis}");
        }
    }
    println!("  committed:   {}", record.is_committed);
    if let Some(path) = &record.source_file_path {
        println!("  source:      {path}");
    }
    if let Some(slug) = &record.local_scratch_slug {
        println!("  local slug:  {slug}");
    }
    if let Some(slug) = &record.production_scratch_slug {
        println!("  prod slug:   {slug}");
    }
    if let Some(url) = &record.pr_url {
        let state = record
            .pr_state
            .map(|state| format!(" ({state})"))
            .unwrap_or_default();
        println!("  pr:          {url}{state}");
    }
    if let Some(notes) = &record.notes {
        println!("  notes:       {notes}");
    }
    println!("  updated:     {}", fmt_when(record.updated_at));
    if let Some(claim) = &claim {
        println!(
            "  claim:       {} until {}",
            claim.agent_id,
            fmt_when(claim.expires_at)
        );
    }
    if !aliases.is_empty() {
        println!("  known names:");
        for alias in &aliases {
            let new_name = alias.new_name.as_deref().unwrap_or("?");
            println!(
                "    {} -> {new_name} ({})",
                alias.old_name, alias.source
            );
        }
    }
    Ok(())
}

fn list_state(ctx: &CliContext, args: &StateListArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let functions = match &args.status {
        Some(raw) => store.get_functions_by_status(raw.parse().map_err(anyhow::Error::msg)?)?,
        None => store.get_all_functions()?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }
    if functions.is_empty() {
        println!("No functions tracked.");
        return Ok(());
    }
    for record in &functions {
        print_function_line(record);
    }
    Ok(())
}

fn list_uncommitted(ctx: &CliContext, args: &StateUncommittedArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let functions = store.get_uncommitted_matches()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }
    if functions.is_empty() {
        println!("Nothing matched and uncommitted.");
        return Ok(());
    }
    println!("Matched but not committed ({}):", functions.len());
    for record in &functions {
        let slug = record.local_scratch_slug.as_deref().unwrap_or("-");
        println!(
            "  {:<40} {:>6.1}%  {slug}",
            record.function_name, record.match_percent
        );
    }
    Ok(())
}

fn list_stale(ctx: &CliContext, args: &StateStaleArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let entries = store.get_stale_data(args.min_hours)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Nothing stale past {:.0}h.", args.min_hours);
        return Ok(());
    }
    for entry in &entries {
        let last = entry.last_verified.map(fmt_when).unwrap_or_else(|| "never".to_string());
        println!(
            "{:<40} {:<22} {:>6.0}h stale  (last {last})",
            entry.function_name,
            entry.stale_type.as_str(),
            entry.hours_stale
        );
    }
    Ok(())
}

fn print_function_line(record: &FunctionRecord) {
    let agent = record.claimed_by_agent.as_deref().unwrap_or("-");
    println!(
        "{:<40} {:<20} {:>6.1}%  {agent}",
        record.function_name,
        record.status.as_str(),
        record.match_percent
    );
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum AuditCommand {
    /// Read the change ledger, newest first.
    History(AuditHistoryArgs),
}

#[derive(Args, Debug)]
pub struct AuditHistoryArgs {
    /// Entity type: function, claim, subdirectory_lock, alias, scratch,
    /// agent, sync, or meta.
    #[arg(long)]
    pub entity: Option<String>,
    /// Entity id, e.g. a function name or workspace key.
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    #[arg(long)]
    pub json: bool,
}

pub fn handle_audit_command(command: AuditCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        AuditCommand::History(args) => audit_history(&ctx, &args),
    }
}

fn audit_history(ctx: &CliContext, args: &AuditHistoryArgs) -> Result<()> {
    let kind = args
        .entity
        .as_deref()
        .map(str::parse::<EntityKind>)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let store = ctx.open_store()?;
    let entries = store.get_history(kind, args.id.as_deref(), args.agent.as_deref(), args.limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    for entry in &entries {
        let agent = entry.agent_id.as_deref().unwrap_or("-");
        println!(
            "{}  {:<10} {:<28} {agent}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.action.as_str(),
            format!("{}/{}", entry.entity_type.as_str(), entry.entity_id),
        );
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum AgentCommand {
    /// Register this agent (or refresh its worktree and branch).
    Register(AgentRegisterArgs),
    /// Per-agent claim and commit counts.
    Summary(AgentSummaryArgs),
}

#[derive(Args, Debug)]
pub struct AgentRegisterArgs {
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub worktree_path: Option<String>,
    #[arg(long)]
    pub branch: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AgentSummaryArgs {
    #[arg(long)]
    pub json: bool,
}

pub fn handle_agent_command(command: AgentCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        AgentCommand::Register(args) => register_agent(&ctx, &args),
        AgentCommand::Summary(args) => agent_summary(&ctx, &args),
    }
}

fn register_agent(ctx: &CliContext, args: &AgentRegisterArgs) -> Result<()> {
    let agent = ctx.resolve_agent(args.agent.as_deref());

    let mut store = ctx.open_store()?;
    store.upsert_agent(
        &agent,
        args.worktree_path.as_deref(),
        args.branch.as_deref(),
        Utc::now(),
    )?;

    if args.json {
        let payload = json!({
            "agent": agent,
            "worktree_path": args.worktree_path,
            "branch": args.branch,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    println!("Registered: {agent}");
    Ok(())
}

fn agent_summary(ctx: &CliContext, args: &AgentSummaryArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let summaries = store.get_agent_summary()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    for summary in &summaries {
        let last = summary
            .last_active_at
            .map(fmt_when)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:>3} active, {:>3} committed  (last active {last})",
            summary.agent_id, summary.active_claims, summary.committed_functions
        );
        if let Some(worktree) = &summary.worktree_path {
            let branch = summary.branch_name.as_deref().unwrap_or("-");
            println!("    {worktree} [{branch}]");
        }
    }
    Ok(())
}
