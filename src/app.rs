use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;

use crate::audit;
use crate::config::AppConfig;
use crate::model::board::BoardState;
use crate::model::record::{Link, Record, RecordId};
use crate::providers::{self, BoardProvider, FetchError, TrackerProvider};
use crate::sync::builder::{self, BuilderConfig, BuildOutcome, BuildWarning};
use crate::sync::engine::{self, EngineConfig};
use crate::sync::ranker;

/// One full reconciliation pass: fetch, group, diff, apply, report.
pub async fn run_sync(config: &AppConfig, dry_run: bool) -> Result<()> {
    let tracker = providers::create_tracker(config)?;
    let board = providers::create_board(config)?;
    let projects = tracker_projects(config)?;

    let (records, links, state) = fetch_everything(&*tracker, &*board, &projects).await?;

    // A bad column table should fail here, not after half the operations.
    config
        .sync
        .columns
        .validate(&state)
        .context("stage -> column mapping does not match the live board")?;

    let outcome = build(config, &records, &links);
    let engine_config = engine_config(config);
    let reconciled = engine::reconcile(&outcome.units, &state, &engine_config);

    for (id, reason) in &reconciled.skipped {
        log::warn!("skipped {id}: {reason}");
    }

    if reconciled.operations.is_empty() {
        println!("Board already converged; nothing to do.");
        return Ok(());
    }

    if dry_run {
        println!("Would apply {} operations:", reconciled.operations.len());
        for op in &reconciled.operations {
            println!("  {}", serde_json::to_string(op)?);
            audit::append_entry(&audit::new_entry(op, "planned", None, None))?;
        }
        return Ok(());
    }

    // Apply strictly in order: a creation must be acknowledged before the
    // operations that reference it can resolve.
    let mut created: HashMap<RecordId, u64> = HashMap::new();
    let mut applied = 0usize;
    let mut failed = 0usize;
    for op in &reconciled.operations {
        match board.apply_operation(op, &created).await {
            Ok(assigned) => {
                if let (Some(id), Some(reference)) = (assigned, op.creates()) {
                    created.insert(reference.clone(), id);
                }
                audit::append_entry(&audit::new_entry(op, "applied", assigned, None))?;
                applied += 1;
            }
            Err(e) => {
                log::warn!("operation failed, will re-emerge next run: {e}");
                audit::append_entry(&audit::new_entry(op, "failed", None, Some(e.to_string())))?;
                failed += 1;
            }
        }
    }

    println!(
        "Applied {applied} of {} operations ({failed} failed, {} units skipped).",
        reconciled.operations.len(),
        reconciled.skipped.len()
    );
    Ok(())
}

/// Print the review queue in priority order.
pub async fn run_rank(config: &AppConfig) -> Result<()> {
    let tracker = providers::create_tracker(config)?;
    let board = providers::create_board(config)?;
    let projects = tracker_projects(config)?;

    let (records, links, state) = fetch_everything(&*tracker, &*board, &projects).await?;
    let outcome = build(config, &records, &links);

    let items = ranker::review_items(&outcome.units, &state, &config.review.offsets, Utc::now());
    let ranked = ranker::rank(items);

    if ranked.is_empty() {
        println!("Nothing is awaiting review.");
        return Ok(());
    }
    println!("Review queue ({} items):", ranked.len());
    for (slot, item) in ranked.iter().enumerate() {
        let discussion = item
            .oldest_discussion_days
            .map(|d| format!(", oldest open discussion {d}d"))
            .unwrap_or_default();
        println!(
            "{:>3}. {} — {} (waiting {}d, {} blockers{discussion})",
            slot + 1,
            item.id,
            item.title,
            item.latency_days,
            item.unresolved_blockers,
        );
    }
    Ok(())
}

fn tracker_projects(config: &AppConfig) -> Result<Vec<String>> {
    let projects = config
        .tracker
        .as_ref()
        .map(|t| t.projects.clone())
        .unwrap_or_default();
    if projects.is_empty() {
        bail!("no tracker projects configured");
    }
    Ok(projects)
}

fn engine_config(config: &AppConfig) -> EngineConfig {
    EngineConfig {
        columns: config.sync.columns.clone(),
        manual_tag_prefix: config.sync.manual_tag_prefix.clone(),
        close_done: config.sync.close_done,
    }
}

fn build(config: &AppConfig, records: &[Record], links: &[Link]) -> BuildOutcome {
    let builder_config = BuilderConfig {
        primary_rule: config.sync.primary_rule,
        max_depth: config.sync.max_depth,
    };
    let outcome = builder::build_units(records, links, &builder_config);
    for warning in &outcome.warnings {
        match warning {
            BuildWarning::AmbiguousMembership {
                record,
                kept_by,
                contender,
            } => log::warn!("{record} requested by both {kept_by} and {contender}; {kept_by} keeps it"),
            BuildWarning::UnknownLinkKind { from, raw } => {
                log::warn!("ignoring link of unknown kind '{raw}' on {from}")
            }
        }
    }
    for (id, error) in &outcome.failures {
        log::warn!("unit {id} not built: {error}");
    }
    log::info!(
        "built {} work units ({} failed, {} warnings)",
        outcome.units.len(),
        outcome.failures.len(),
        outcome.warnings.len()
    );
    outcome
}

/// All reads are independent, so issue them concurrently and join. Output
/// does not depend on this; it only trims wall-clock time.
async fn fetch_everything(
    tracker: &dyn TrackerProvider,
    board: &dyn BoardProvider,
    projects: &[String],
) -> Result<(Vec<Record>, Vec<Link>, BoardState)> {
    let per_project = futures::future::try_join_all(projects.iter().map(|project| async move {
        let (records, links) = tokio::try_join!(
            tracker.fetch_records(project),
            tracker.fetch_links(project)
        )?;
        Ok::<_, FetchError>((records, links))
    }));

    let (fetched, state) = tokio::try_join!(per_project, board.fetch_board_state())
        .map_err(describe_fetch_error)?;

    let mut records = Vec::new();
    let mut links = Vec::new();
    for (mut r, mut l) in fetched {
        records.append(&mut r);
        links.append(&mut l);
    }
    Ok((records, links, state))
}

fn describe_fetch_error(err: FetchError) -> anyhow::Error {
    if err.is_transient() {
        anyhow!(err).context("fetch failed; worth retrying in a bit")
    } else {
        anyhow!(err).context("fetch failed permanently; check credentials and project refs")
    }
}
