//src/main.rs
mod cli; // Keep cli module for parsing args

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use std::io::stdout;
use tracing_subscriber::EnvFilter;

use active_session_lib::{
    parse_ai_recommendation, AppContext, DeloadSuggestion, HistoryItem, QueueSummary,
    ReportHistory, Units,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli_args = cli::parse_args(); // Parse arguments once

    if let cli::Commands::GenerateCompletion { shell } = cli_args.command {
        let mut cmd = cli::build_cli_command();
        let bin_name = cmd.get_name().to_string();
        eprintln!("Generating completion script for {shell}...");
        clap_complete::generate(shell, &mut cmd, bin_name, &mut stdout());
        return Ok(());
    }

    init_tracing();
    let mut context = AppContext::initialize().context("Failed to initialize application")?;
    let header_color = Color::Green;
    let units = context.config.units;

    match cli_args.command {
        cli::Commands::GenerateCompletion { .. } => {
            unreachable!("Completion generation should have exited already");
        }
        cli::Commands::History { exercise, local } => {
            let history = if local {
                context.local_deload_history()
            } else {
                let (history, written_at) = context.cached_history();
                match written_at {
                    Some(at) => println!("History cached at {}", at.format("%Y-%m-%d %H:%M UTC")),
                    None => println!("No cached history. Run 'refresh-history' first."),
                }
                history
            };
            print_history_table(&history, exercise.as_deref(), header_color, units);
        }
        cli::Commands::RefreshHistory => {
            let history = context.refresh_history().await?;
            println!(
                "History rebuilt: {} exercises cached.",
                history.exercises.len()
            );
        }
        cli::Commands::Deload {
            exercise,
            ai_weight,
            ai_note,
            percent,
            weight,
        } => {
            let ai_weight = ai_weight.or_else(|| {
                ai_note
                    .as_deref()
                    .and_then(|note| parse_ai_recommendation(note).weight)
            });
            let mut suggestion = context.deload_for(&exercise, ai_weight)?;
            if let Some(pct) = percent {
                suggestion.adjust_percent(pct, &context.config.deload);
            }
            if let Some(w) = weight {
                if w <= 0.0 {
                    bail!("Weight must be a positive number.");
                }
                suggestion.adjust_weight(w, &context.config.deload);
            }
            print_deload(&suggestion, context.config.deload.history_min, units);
        }
        cli::Commands::Queue { offline } => {
            let summary = context.queue_summary(!offline)?;
            print_queue_table(&summary, header_color);
        }
        cli::Commands::Sync { force } => {
            let report = context.sync(force).await?;
            println!(
                "Delivered {} job(s), {} failed, {} skipped.",
                report.processed, report.errors, report.skipped
            );
        }
        cli::Commands::BumpJob { id } => {
            context.bump_job(&id)?;
            println!("Job {id} is due now.");
        }
        cli::Commands::SetServer { url, token } => {
            context.set_server(&url, token)?;
            println!(
                "Server set to {}",
                context.config.server_url.as_deref().unwrap_or_default()
            );
        }
        cli::Commands::ConfigPath => {
            println!("Config file is located at: {:?}", context.get_config_path());
        }
        cli::Commands::DbPath => {
            println!("Database file is located at: {:?}", context.get_db_path());
        }
    }

    Ok(())
}

fn format_ts(ts: i64) -> String {
    Utc.timestamp_millis_opt(ts)
        .single()
        .map_or_else(|| "-".to_string(), |d: DateTime<Utc>| d.format("%Y-%m-%d").to_string())
}

fn opt_num(value: Option<f64>) -> String {
    value.map_or("-".to_string(), |v| format!("{v:.1}"))
}

// --- Table Printing Functions ---

/// Prints the history series, optionally for a single exercise.
fn print_history_table(
    history: &ReportHistory,
    exercise: Option<&str>,
    header_color: Color,
    units: Units,
) {
    let mut table = Table::new();
    let unit = units.weight_label();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Exercise").fg(header_color),
            Cell::new("Date").fg(header_color),
            Cell::new(format!("Avg Weight ({unit})")).fg(header_color),
            Cell::new("Avg Reps").fg(header_color),
            Cell::new(format!("Top Weight ({unit})")).fg(header_color),
            Cell::new("Volume").fg(header_color),
            Cell::new("Sets").fg(header_color),
        ]);

    let mut rows = 0;
    let mut add = |name: &str, items: &[HistoryItem]| {
        for item in items {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(format_ts(item.ts)),
                Cell::new(opt_num(item.avg_weight)),
                Cell::new(opt_num(item.avg_reps)),
                Cell::new(opt_num(item.top_weight)),
                Cell::new(format!("{:.0}", item.total_volume)),
                Cell::new(item.sets_count.to_string()),
            ]);
            rows += 1;
        }
    };
    match exercise {
        Some(name) => add(name, history.series(name)),
        None => {
            for series in history.exercises.values() {
                add(&series.name, &series.items);
            }
        }
    }
    if rows == 0 {
        println!("No history found.");
        return;
    }
    println!("{table}");
}

fn print_deload(suggestion: &DeloadSuggestion, history_min: usize, units: Units) {
    let unit = units.weight_label();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.add_row(vec![
        Cell::new("Exercise").add_attribute(Attribute::Bold),
        Cell::new(&suggestion.name),
    ]);
    table.add_row(vec![
        Cell::new("Trend").add_attribute(Attribute::Bold),
        Cell::new(suggestion.analysis.status.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Base weight").add_attribute(Attribute::Bold),
        Cell::new(format!(
            "{:.1} {unit} (from {})",
            suggestion.base_weight, suggestion.base_source
        )),
    ]);
    table.add_row(vec![
        Cell::new("Suggested weight").add_attribute(Attribute::Bold),
        Cell::new(format!("{:.1} {unit}", suggestion.suggested_weight)).fg(Color::Cyan),
    ]);
    table.add_row(vec![
        Cell::new("Minimum (1RM floor)").add_attribute(Attribute::Bold),
        Cell::new(format!("{:.1} {unit}", suggestion.min_weight)),
    ]);
    println!("{table}");
    println!("{}", suggestion.reason(history_min));
}

fn print_queue_table(summary: &QueueSummary, header_color: Color) {
    println!(
        "{} | pending: {} | failed: {} | due now: {}",
        if summary.online { "online" } else { "offline" },
        summary.pending,
        summary.failed,
        summary.due
    );
    if let Some(next) = summary.next_due_at {
        println!("Next retry at {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if summary.jobs.is_empty() {
        println!("Queue is empty.");
        return;
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(header_color),
            Cell::new("Created (UTC)").fg(header_color),
            Cell::new("Workout").fg(header_color),
            Cell::new("Status").fg(header_color),
            Cell::new("Attempts").fg(header_color),
            Cell::new("Next Attempt").fg(header_color),
            Cell::new("Last Error").fg(header_color),
        ]);
    for job in &summary.jobs {
        table.add_row(vec![
            Cell::new(&job.id),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(&job.details),
            Cell::new(job.status.to_string()),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(
                job.next_attempt_at
                    .map_or("now".to_string(), |t| t.format("%H:%M:%S").to_string()),
            ),
            Cell::new(job.last_error.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
}
