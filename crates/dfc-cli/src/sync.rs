//! `dfc sync`: folding externally computed facts into the store. Build
//! reports and symbol tables arrive as plain JSON maps; PR state and scratch
//! results arrive as flags.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use dfc_core::identity::AddressValue;
use dfc_core::{PrFacts, ReconcileSummary, ReportFact, ScratchInstance, ScratchPatch};
use serde_json::json;
use tracing::warn;

use crate::context::CliContext;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum SyncCommand {
    /// Reconcile a build report against the store.
    Report(SyncReportArgs),
    /// Fold a symbol table's addresses into the store.
    Symbols(SyncSymbolsArgs),
    /// Fold remote PR state into a function record.
    PrState(SyncPrStateArgs),
    /// Record a scratch and, optionally, a compile score.
    Scratch(SyncScratchArgs),
}

#[derive(Args, Debug)]
pub struct SyncReportArgs {
    /// Report JSON: `{"<function>": {"match_percent": 87.5, "address": ...}}`.
    pub report: PathBuf,
    /// Write the reconciliation back instead of only printing it.
    #[arg(long)]
    pub apply: bool,
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SyncSymbolsArgs {
    /// Symbol map JSON: `{"<function>": "<address>"}`; values may be numbers.
    pub symbols: PathBuf,
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SyncPrStateArgs {
    pub function_name: String,
    #[arg(long)]
    pub url: Option<String>,
    /// PR number; parsed from the URL when absent.
    #[arg(long)]
    pub number: Option<i64>,
    /// open, closed, or merged.
    #[arg(long)]
    pub state: Option<String>,
    /// Shown in output, never stored.
    #[arg(long)]
    pub review_decision: Option<String>,
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SyncScratchArgs {
    /// Scratch slug on the compilation service.
    pub slug: String,
    /// local or production.
    #[arg(long, default_value = "local")]
    pub instance: String,
    #[arg(long, default_value = "https://decomp.me")]
    pub base_url: String,
    /// Function the scratch decompiles.
    #[arg(long)]
    pub function: Option<String>,
    /// Diff score from the compile; zero is a perfect match.
    #[arg(long)]
    pub score: Option<i64>,
    #[arg(long)]
    pub max_score: Option<i64>,
    /// Production slug this scratch was pushed to.
    #[arg(long)]
    pub production: Option<String>,
    #[arg(long)]
    pub worktree_path: Option<String>,
    #[arg(long)]
    pub branch: Option<String>,
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub json: bool,
}

pub fn handle_sync_command(command: SyncCommand) -> Result<()> {
    let ctx = CliContext::new()?;

    match command {
        SyncCommand::Report(args) => sync_report(&ctx, &args),
        SyncCommand::Symbols(args) => sync_symbols(&ctx, &args),
        SyncCommand::PrState(args) => sync_pr_state(&ctx, &args),
        SyncCommand::Scratch(args) => sync_scratch(&ctx, &args),
    }
}

fn sync_report(ctx: &CliContext, args: &SyncReportArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.report)
        .with_context(|| format!("reading {}", args.report.display()))?;
    let facts: BTreeMap<String, ReportFact> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.report.display()))?;
    let agent = ctx.resolve_agent(args.agent.as_deref());

    let mut store = ctx.open_store()?;
    let summary = store.reconcile_report(&facts, Some(&agent), args.apply, Utc::now())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_reconcile_summary(&summary);
    Ok(())
}

fn print_reconcile_summary(summary: &ReconcileSummary) {
    let verb = if summary.applied { "Applied" } else { "Would apply" };

    for update in &summary.match_updates {
        println!(
            "{verb} match {}: {:.1}% -> {:.1}%",
            update.function_name, update.old_percent, update.new_percent
        );
    }
    for update in &summary.status_updates {
        println!(
            "{verb} status {}: {} -> {}",
            update.function_name, update.old_status, update.new_status
        );
    }
    for rename in &summary.renames {
        println!(
            "{verb} rename {} -> {} ({})",
            rename.old_name, rename.new_name, rename.canonical_address
        );
    }
    if !summary.new_functions.is_empty() {
        println!("New in report ({}):", summary.new_functions.len());
        for name in &summary.new_functions {
            println!("  {name}");
        }
    }
    if !summary.missing_in_report.is_empty() {
        println!(
            "Tracked but missing from report ({}):",
            summary.missing_in_report.len()
        );
        for name in &summary.missing_in_report {
            println!("  {name}");
        }
    }
    println!(
        "{} match updates, {} status updates, {} renames, {} new, {} missing{}",
        summary.match_updates.len(),
        summary.status_updates.len(),
        summary.renames.len(),
        summary.new_functions.len(),
        summary.missing_in_report.len(),
        if summary.applied {
            ""
        } else {
            " (dry run; pass --apply to write)"
        }
    );
}

fn sync_symbols(ctx: &CliContext, args: &SyncSymbolsArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.symbols)
        .with_context(|| format!("reading {}", args.symbols.display()))?;
    let symbols: BTreeMap<String, AddressValue> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.symbols.display()))?;

    let mut addresses = BTreeMap::new();
    let mut unparsable = 0usize;
    for (name, value) in &symbols {
        match value.normalize() {
            Some(canonical) => {
                addresses.insert(name.clone(), canonical);
            }
            None => {
                unparsable += 1;
                warn!("skipping {name}: unparsable address");
            }
        }
    }

    let agent = ctx.resolve_agent(args.agent.as_deref());
    let mut store = ctx.open_store()?;
    let updated = store.bulk_update_addresses(&addresses, Some(&agent), Utc::now())?;

    if args.json {
        let payload = json!({
            "updated": updated,
            "total": symbols.len(),
            "unparsable": unparsable,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    println!(
        "Updated {updated} of {} addresses ({unparsable} unparsable)",
        symbols.len()
    );
    Ok(())
}

fn sync_pr_state(ctx: &CliContext, args: &SyncPrStateArgs) -> Result<()> {
    let state = args
        .state
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let facts = PrFacts {
        url: args.url.clone(),
        number: args.number,
        state,
        review_decision: args.review_decision.clone(),
    };

    let agent = ctx.resolve_agent(args.agent.as_deref());
    let mut store = ctx.open_store()?;
    let before = store
        .get_function(&args.function_name)?
        .map(|record| record.status);
    let after = store.apply_pr_facts(&args.function_name, &facts, Some(&agent), Utc::now())?;

    if args.json {
        let payload = json!({
            "function": args.function_name,
            "old_status": before,
            "new_status": after,
            "review_decision": args.review_decision,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    let before = before.map(|status| status.to_string());
    println!(
        "{}: {} -> {after}",
        args.function_name,
        before.as_deref().unwrap_or("absent")
    );
    if let Some(decision) = &args.review_decision {
        println!("  review: {decision}");
    }
    Ok(())
}

fn sync_scratch(ctx: &CliContext, args: &SyncScratchArgs) -> Result<()> {
    let instance: ScratchInstance = args.instance.parse().map_err(anyhow::Error::msg)?;
    let agent = ctx.resolve_agent(args.agent.as_deref());
    let now = Utc::now();

    let patch = ScratchPatch {
        function_name: args.function.clone(),
        owner_agent: Some(agent.clone()),
        ..ScratchPatch::default()
    };

    let mut store = ctx.open_store()?;
    store.upsert_scratch(&args.slug, instance, &args.base_url, &patch, Some(&agent), now)?;

    let recorded = match (args.score, args.max_score) {
        (Some(score), Some(max_score)) => Some(store.record_match_score(
            &args.slug,
            score,
            max_score,
            args.worktree_path.as_deref(),
            args.branch.as_deref(),
            now,
        )?),
        (None, None) => None,
        _ => bail!("--score and --max-score go together"),
    };

    if let Some(production) = &args.production {
        store.record_sync(&args.slug, production, args.function.as_deref(), now)?;
    }

    let scratch = store.get_scratch(&args.slug)?;

    if args.json {
        let payload = json!({
            "scratch": scratch,
            "score_recorded": recorded,
            "production": args.production,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Scratch {} ({instance})", args.slug);
    match recorded {
        Some(true) => {
            if let Some(percent) = scratch.as_ref().and_then(|scratch| scratch.match_percent) {
                println!("  score recorded: {percent:.1}% match");
            } else {
                println!("  score recorded");
            }
        }
        Some(false) => println!("  score unchanged; not re-recorded"),
        None => {}
    }
    if let Some(production) = &args.production {
        println!("  synced to production scratch {production}");
    }
    Ok(())
}
