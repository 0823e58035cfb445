//! `runs list` and `runs show` handlers.

use std::process::ExitCode;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use devflow_core::repository::RunRepository;
use devflow_types::run::RunResult;
use uuid::Uuid;

use super::{Output, format_cost, format_duration_ms, run_status_cell, step_status_cell, styled_status};
use crate::state::AppState;

pub async fn handle_list(limit: u32, out: Output) -> Result<ExitCode> {
    let state = AppState::init(None).await?;
    let runs = state
        .runs()
        .list_runs(limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if out.json {
        let rows: Vec<serde_json::Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id.to_string(),
                    "workflow": r.workflow,
                    "status": r.status.to_string(),
                    "steps": r.steps.len(),
                    "total_cost": r.total_cost,
                    "started_at": r.started_at.to_rfc3339(),
                    "completed_at": r.completed_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }
    if out.quiet {
        return Ok(ExitCode::SUCCESS);
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded yet.");
        println!(
            "  Start one with {}",
            style("dflow run <file.yaml> --gateway <url>").dim()
        );
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Cost"),
            Cell::new("Started"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(r.run_id.to_string()),
            Cell::new(&r.workflow),
            run_status_cell(r.status),
            Cell::new(r.steps.len()),
            Cell::new(format_cost(r.total_cost)),
            Cell::new(r.started_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(ExitCode::SUCCESS)
}

pub async fn handle_show(run_id: &str, out: Output) -> Result<ExitCode> {
    let id: Uuid = run_id
        .parse()
        .with_context(|| format!("'{run_id}' is not a run ID"))?;
    let state = AppState::init(None).await?;
    let run = state
        .runs()
        .get_run(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load run: {e}"))?
        .with_context(|| format!("Run '{id}' not found"))?;

    print_run(&run, out)?;
    Ok(ExitCode::SUCCESS)
}

/// Print a run summary and its step table (or the whole record as JSON).
pub fn print_run(run: &RunResult, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  Run {} of '{}': {}",
        style(run.run_id).dim(),
        style(&run.workflow).cyan(),
        styled_status(run.status)
    );
    println!("  Total cost: {}", format_cost(run.total_cost));
    if let Some(completed) = run.completed_at {
        let elapsed = (completed - run.started_at).num_milliseconds().max(0) as u64;
        println!("  Duration:   {}", format_duration_ms(elapsed));
    }

    if !run.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Cost"),
                Cell::new("Time"),
                Cell::new("Error"),
            ]);
        for s in &run.steps {
            let mut status = step_status_cell(s.status);
            if s.review_required {
                status = Cell::new(format!("{} (review)", s.status)).fg(Color::Yellow);
            }
            table.add_row(vec![
                Cell::new(&s.step),
                status,
                Cell::new(s.attempts),
                Cell::new(format_cost(s.cost)),
                Cell::new(format_duration_ms(s.elapsed_ms)),
                Cell::new(
                    s.error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(failure) = &run.failure {
        println!();
        println!(
            "  {} Step '{}' failed ({}) after {} attempt(s): {}",
            style("x").red().bold(),
            failure.step,
            failure.kind,
            failure.attempts,
            failure.message
        );
    }

    if let Some(rollback) = &run.rollback {
        let outcome = if rollback.succeeded {
            style("complete").green()
        } else {
            style("incomplete").red()
        };
        println!("  Rollback {outcome}");
        if !rollback.undone.is_empty() {
            println!("    undone:         {}", rollback.undone.join(", "));
        }
        if !rollback.not_reversible.is_empty() {
            println!("    not reversible: {}", rollback.not_reversible.join(", "));
        }
        if let Some(failure) = &rollback.failure {
            println!("    {}", style(&failure.message).red());
        }
    }
    println!();
    Ok(())
}
