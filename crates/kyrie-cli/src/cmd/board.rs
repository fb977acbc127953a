//! `kyrie board`: inspect a board snapshot and replay change streams into it.
//!
//! `kyrie board lanes`: mount a snapshot and print its lanes.
//! `kyrie board replay`: mount a snapshot, push a JSONL file of change
//! payloads through an in-process feed, and print the resulting lanes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use kyrie_core::config::BoardConfig;
use kyrie_core::error::ErrorCode;
use kyrie_core::event::RawChange;
use kyrie_core::feed::MemoryFeed;
use kyrie_core::listener::ListenerStats;
use kyrie_core::model::{Issue, ProjectId};
use kyrie_core::{BoardSession, SnapshotSource};
use serde::Serialize;

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct BoardArgs {
    #[command(subcommand)]
    pub command: BoardCommand,
}

#[derive(Subcommand, Debug)]
pub enum BoardCommand {
    #[command(
        about = "Render the lanes of a board snapshot",
        after_help = "EXAMPLES:\n    # Show lanes for the snapshot's project\n    kyrie board lanes --snapshot board.json\n\n\
                      # Machine-readable output\n    kyrie board lanes --snapshot board.json --format json"
    )]
    Lanes(LanesArgs),

    #[command(
        about = "Replay change payloads into a board snapshot",
        long_about = "Mount a board from a snapshot, subscribe it to an in-process feed, publish\n\
                      every change payload from a JSONL file, and render the resulting lanes\n\
                      together with listener statistics.",
        after_help = "EXAMPLES:\n    # Replay a captured change stream\n    kyrie board replay --snapshot board.json --events changes.jsonl"
    )]
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
pub struct LanesArgs {
    /// JSON array of issues with assignees joined.
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Project to show. Defaults to the project of the first issue.
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON array of issues with assignees joined.
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Change payloads, one JSON object per line.
    #[arg(long)]
    pub events: PathBuf,

    /// Project to show. Defaults to the project of the first issue.
    #[arg(long)]
    pub project: Option<String>,
}

/// Snapshot read from a JSON file, filtered to the requested project.
struct FileSnapshot {
    issues: Vec<Issue>,
}

#[async_trait]
impl SnapshotSource for FileSnapshot {
    async fn load_issues(&self, project_id: &ProjectId) -> Result<Vec<Issue>> {
        Ok(self
            .issues
            .iter()
            .filter(|issue| &issue.row.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct CardOutput {
    key: String,
    id: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,
}

#[derive(Debug, Serialize)]
struct LaneOutput {
    status: String,
    title: String,
    count: usize,
    cards: Vec<CardOutput>,
}

#[derive(Debug, Serialize)]
struct LanesOutput {
    project: String,
    total: usize,
    lanes: Vec<LaneOutput>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    #[serde(flatten)]
    board: LanesOutput,
    events_read: usize,
    unparsable_lines: usize,
    stats: ListenerStats,
}

fn read_snapshot(path: &Path) -> Result<Vec<Issue>> {
    let content = fs::read_to_string(path)
        .map_err(|e| CliError::coded(ErrorCode::SnapshotUnreadable, format!("{}: {e}", path.display())))?;
    let issues: Vec<Issue> = serde_json::from_str(&content)
        .map_err(|e| CliError::coded(ErrorCode::SnapshotUnreadable, format!("{}: {e}", path.display())))?;
    Ok(issues)
}

fn pick_project(explicit: Option<&str>, issues: &[Issue]) -> Result<ProjectId> {
    if let Some(project) = explicit {
        return Ok(ProjectId::new(project));
    }
    issues
        .first()
        .map(|issue| issue.row.project_id.clone())
        .ok_or_else(|| {
            CliError::coded(
                ErrorCode::SnapshotUnreadable,
                "snapshot is empty; pass --project to choose a board",
            )
            .into()
        })
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .context("Failed to start async runtime")
}

fn lanes_output(board: &BoardSession) -> LanesOutput {
    let lanes = board.lanes();
    LanesOutput {
        project: board.project_id().to_string(),
        total: lanes.total(),
        lanes: lanes
            .lanes
            .iter()
            .map(|lane| LaneOutput {
                status: lane.status.as_str().to_string(),
                title: lane.title.to_string(),
                count: lane.len(),
                cards: lane
                    .issues
                    .iter()
                    .map(|issue| CardOutput {
                        key: board.display_key(issue),
                        id: issue.id().to_string(),
                        title: issue.row.title.clone(),
                        assignee: issue.assignee.as_ref().map(|a| a.label().to_string()),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn write_lanes_text(out: &LanesOutput, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(w, "board project={} total={}", out.project, out.total)?;
    for lane in &out.lanes {
        writeln!(w, "lane status={} count={}", lane.status, lane.count)?;
        for card in &lane.cards {
            writeln!(
                w,
                "card key={} id={} assignee={} title={}",
                card.key,
                card.id,
                card.assignee.as_deref().unwrap_or("-"),
                card.title
            )?;
        }
    }
    Ok(())
}

fn write_lanes_pretty(out: &LanesOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Board {}", out.project))?;
    for lane in &out.lanes {
        writeln!(w, "{} ({})", lane.title, lane.count)?;
        for card in &lane.cards {
            match &card.assignee {
                Some(assignee) => writeln!(w, "  {:<10} {}  @{assignee}", card.key, card.title)?,
                None => writeln!(w, "  {:<10} {}", card.key, card.title)?,
            }
        }
    }
    pretty_kv(w, "Total", out.total.to_string())
}

/// Execute `kyrie board lanes`.
pub fn run_lanes(args: &LanesArgs, config: &BoardConfig, output: OutputMode) -> Result<()> {
    let issues = read_snapshot(&args.snapshot)?;
    let project_id = pick_project(args.project.as_deref(), &issues)?;
    let source = FileSnapshot { issues };

    let board = runtime()?.block_on(BoardSession::mount_from(&source, project_id, config.clone()))?;
    let out = lanes_output(&board);
    board.dispose();

    render_mode(output, &out, write_lanes_text, write_lanes_pretty)
}

/// Execute `kyrie board replay`.
pub fn run_replay(args: &ReplayArgs, config: &BoardConfig, output: OutputMode) -> Result<()> {
    let issues = read_snapshot(&args.snapshot)?;
    let project_id = pick_project(args.project.as_deref(), &issues)?;
    let source = FileSnapshot { issues };
    let events = fs::read_to_string(&args.events)
        .with_context(|| format!("Failed to read {}", args.events.display()))?;

    let out = runtime()?.block_on(async {
        let board = BoardSession::mount_from(&source, project_id, config.clone()).await?;
        let feed = MemoryFeed::new();
        let mut subscription = board
            .subscribe(&feed)
            .await
            .map_err(|e| CliError::coded(ErrorCode::SubscriptionFailed, e))?;
        let mut listener = board.listener();

        let mut events_read = 0;
        let mut unparsable_lines = 0;
        for (line_no, line) in events.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawChange>(line) {
                Ok(change) => {
                    events_read += 1;
                    feed.publish(change);
                    listener.pump(&mut subscription);
                }
                Err(err) => {
                    unparsable_lines += 1;
                    tracing::warn!(line = line_no + 1, %err, "skipping unparsable change line");
                }
            }
        }

        subscription.unsubscribe();
        let out = ReplayOutput {
            board: lanes_output(&board),
            events_read,
            unparsable_lines,
            stats: listener.stats(),
        };
        board.dispose();
        anyhow::Ok(out)
    })?;

    render_mode(
        output,
        &out,
        |out, w| {
            write_lanes_text(&out.board, w)?;
            writeln!(
                w,
                "replay events={} unparsable={} inserted={} updated={} deleted={} ignored={} dropped={}",
                out.events_read,
                out.unparsable_lines,
                out.stats.inserted,
                out.stats.updated,
                out.stats.deleted,
                out.stats.ignored,
                out.stats.dropped
            )
        },
        |out, w| {
            write_lanes_pretty(&out.board, w)?;
            writeln!(w)?;
            pretty_section(w, "Replay")?;
            pretty_kv(w, "Events", out.events_read.to_string())?;
            pretty_kv(w, "Unparsable", out.unparsable_lines.to_string())?;
            pretty_kv(
                w,
                "Applied",
                format!(
                    "{} inserted, {} updated, {} deleted",
                    out.stats.inserted, out.stats.updated, out.stats.deleted
                ),
            )?;
            pretty_kv(
                w,
                "Skipped",
                format!("{} ignored, {} dropped", out.stats.ignored, out.stats.dropped),
            )
        },
    )
}
