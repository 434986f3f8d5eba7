mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use media_duper_core::merge::{MergePlan, MergePlanner};
use media_duper_core::model::{FileId, GroupId, GroupStatus};
use media_duper_core::storage::Database;
use media_duper_core::{AppConfig, DetectionEngine, DuplicateGroup, MergeService};
use progress::CliReporter;
use tracing::{debug, error, info, warn};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match media_duper_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Detect) => run_detect(&config),
        Some(Commands::Groups { all }) => run_groups(&config, all),
        Some(Commands::Plan { group_id, keeper }) => run_plan(&config, group_id, keeper),
        Some(Commands::Merge {
            group_ids,
            keeper,
            yes,
        }) => run_merge(&config, &group_ids, keeper, yes),
        Some(Commands::UndoList) => run_undo_list(&config),
        Some(Commands::Undo {
            transaction_id,
            yes,
        }) => run_undo(&config, &transaction_id, yes),
        Some(Commands::Recover) => run_recover(&config),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        Some(Commands::TruncateDb) => run_truncate(&config),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {}", err);
        process::exit(1);
    }
    Ok(())
}

fn open_db(config: &AppConfig) -> Result<Database, Box<dyn std::error::Error>> {
    Ok(Database::open(&config.database_path)?)
}

fn open_service(config: &AppConfig) -> Result<MergeService, Box<dyn std::error::Error>> {
    let service = MergeService::from_provider(open_db(config)?, config)?;
    let recovery = service.startup_recovery();
    if !recovery.is_clean() {
        warn!(
            "Startup recovery: {} restored, {} cleaned, {} failed",
            recovery.restored.len(),
            recovery.cleaned.len(),
            recovery.failed.len()
        );
    }
    Ok(service)
}

fn run_detect(config: &AppConfig) -> CliResult {
    let db = open_db(config)?;
    let engine = DetectionEngine::with_provider(Arc::new(config.clone()));
    let reporter = CliReporter::new();
    let mut sink = |group: &DuplicateGroup| {
        info!(
            "Group {}: {} files, {} ({:.2})",
            group.id,
            group.members.len(),
            group.kind.as_str(),
            group.confidence
        );
    };
    let (report, summary) = engine.run_catalog(&db, &mut sink, &reporter)?;
    let stats = &report.stats;

    println!();
    info!(
        "Detection: {}, {} files, {} unscored",
        format!("{:.2}s", stats.duration.as_secs_f64()).green(),
        stats.files,
        format!("{}", stats.unscored_files).yellow(),
    );
    info!(
        "{} buckets, {} candidate pairs, {} hash comparisons",
        format!("{}", stats.buckets).cyan(),
        format!("{}", stats.candidate_pairs).cyan(),
        format!("{}", stats.hash_comparisons).cyan(),
    );
    info!(
        "{} duplicate groups ({} flagged for manual split), {} skipped, {} previous groups dismissed",
        format!("{}", summary.group_ids.len()).red(),
        format!("{}", stats.flagged_groups).yellow(),
        summary.skipped.len(),
        summary.dismissed,
    );
    if !report.diagnostics.is_empty() {
        warn!("{} diagnostics recorded", report.diagnostics.len());
        for diagnostic in &report.diagnostics {
            debug!("{}", diagnostic.to_error());
        }
    }

    Ok(())
}

fn run_groups(config: &AppConfig, all: bool) -> CliResult {
    let db = open_db(config)?;
    let status = if all { None } else { Some(GroupStatus::Open) };
    let groups = db.get_duplicate_groups(status)?;
    if groups.is_empty() {
        println!("No duplicate groups.");
        return Ok(());
    }

    for group in &groups {
        let flag = if group.needs_manual_split {
            " needs manual split".yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "{} {} {} {:.2} [{}]{}",
            format!("#{}", group.id).bold(),
            group.kind.as_str().cyan(),
            group.status.as_str(),
            group.confidence,
            group.members.len(),
            flag
        );
        for (record, removed) in db.get_group_members(group.id)? {
            let path = record.path.display().to_string();
            let path = if removed { path.dimmed() } else { path.normal() };
            println!("    {:>8}  {}", record.id, path);
        }
        for edge in &group.edges {
            println!(
                "    {:>8} ~ {:<8} {} {:.2}",
                edge.file_a,
                edge.file_b,
                edge.class.as_str(),
                edge.confidence
            );
        }
        println!("    {}", group.rationale.dimmed());
    }
    Ok(())
}

fn run_plan(config: &AppConfig, group_id: GroupId, keeper: Option<FileId>) -> CliResult {
    let db = open_db(config)?;
    let plan = MergePlanner::new(&db).plan(group_id, keeper)?;
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &MergePlan) {
    println!("{}", format!("Group #{}", plan.group_id).bold());
    println!(
        "  {} {} ({} bytes)",
        "keep  ".green(),
        plan.keeper.path.display(),
        plan.keeper.size
    );
    for removal in &plan.removals {
        println!(
            "  {} {} ({} bytes)",
            "remove".red(),
            removal.path.display(),
            removal.size
        );
    }
    for merge in &plan.field_merges {
        println!(
            "  {} {} <- {:?}: {}",
            "merge ".cyan(),
            merge.field.as_str(),
            merge.sources,
            merge.value
        );
    }
    println!("  {} bytes reclaimable", plan.reclaimed_bytes());
}

fn run_merge(
    config: &AppConfig,
    group_ids: &[GroupId],
    keeper: Option<FileId>,
    yes: bool,
) -> CliResult {
    if keeper.is_some() && group_ids.len() > 1 {
        return Err("--keeper can only be used when merging a single group".into());
    }
    let service = open_service(config)?;

    let mut plans = Vec::with_capacity(group_ids.len());
    for &group_id in group_ids {
        match service.plan_merge(group_id, keeper) {
            Ok(plan) => {
                print_plan(&plan);
                plans.push(plan);
            }
            Err(e) => warn!("Skipping group {}: {}", group_id, e),
        }
    }
    if plans.is_empty() {
        return Err("nothing to merge".into());
    }

    let prompt = format!(
        "Stage {} files from {} groups in the holding area?",
        plans.iter().map(|p| p.removals.len()).sum::<usize>(),
        plans.len()
    );
    if !yes && !prompt_confirm(&prompt, Some(false))? {
        println!("Aborted; nothing was changed.");
        return Ok(());
    }

    let reporter = CliReporter::new();
    let results = if plans.len() == 1 {
        vec![(plans[0].group_id, service.execute_merge_with(&plans[0], &reporter))]
    } else {
        service.execute_merge_batch(&plans)?
    };

    let mut failed = 0;
    for (group_id, result) in results {
        match result {
            Ok(outcome) => info!(
                "Group {} merged: kept {}, staged {} files ({} bytes). Undo with: undo {}",
                group_id,
                outcome.keeper_id,
                outcome.removed.len(),
                outcome.reclaimed_bytes,
                outcome.transaction_id.yellow()
            ),
            Err(e) => {
                failed += 1;
                match e.failed_stage() {
                    Some(stage) => error!("Group {} not merged at stage {}: {}", group_id, stage, e),
                    None => error!("Group {} not merged: {}", group_id, e),
                }
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} merges failed", failed).into());
    }
    Ok(())
}

fn run_undo_list(config: &AppConfig) -> CliResult {
    let service = open_service(config)?;
    let entries = service.list_undoable()?;
    if entries.is_empty() {
        println!("No undoable merges.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  group {}  {}  kept {}, {} files staged",
            entry.transaction_id.yellow(),
            entry.group_id,
            entry.committed_at.to_rfc3339(),
            entry.keeper_path.display(),
            entry.removed.len()
        );
    }
    Ok(())
}

fn run_undo(config: &AppConfig, transaction_id: &str, yes: bool) -> CliResult {
    let service = open_service(config)?;
    if !yes
        && !prompt_confirm(
            &format!("Restore all files staged by {}?", transaction_id),
            Some(false),
        )?
    {
        return Ok(());
    }
    let outcome = service.undo(transaction_id)?;
    info!(
        "Restored {} files for group {}",
        format!("{}", outcome.restored.len()).green(),
        outcome.group_id
    );
    Ok(())
}

fn run_recover(config: &AppConfig) -> CliResult {
    let service = open_service(config)?;
    let report = service.startup_recovery();
    if report.is_clean() {
        println!("Holding area is consistent; nothing to recover.");
    }
    for transaction_id in &report.restored {
        println!("{} {}", "restored".green(), transaction_id);
    }
    for transaction_id in &report.cleaned {
        println!("{} {}", "cleaned ".cyan(), transaction_id);
    }
    for (transaction_id, reason) in &report.failed {
        println!("{} {}: {}", "failed  ".red(), transaction_id, reason);
    }
    for transaction_id in &report.busy {
        println!("{} {}: merge in flight", "skipped ".yellow(), transaction_id);
    }
    if !report.failed.is_empty() {
        return Err(format!("{} transactions need attention", report.failed.len()).into());
    }
    Ok(())
}

fn run_truncate(config: &AppConfig) -> CliResult {
    if !prompt_confirm(
        "Are you SURE you want to COMPLETELY DELETE the catalog?",
        Some(false),
    )? {
        return Ok(());
    }
    open_db(config)?.truncate_all()?;
    println!("All tables truncated");
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
