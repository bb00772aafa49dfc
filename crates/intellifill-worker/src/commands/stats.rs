//! Stats command - queue counts, timings and health
//!
//! Usage:
//! ```bash
//! intellifill-worker stats
//! intellifill-worker stats --queue ocr
//! intellifill-worker stats --prometheus
//! ```

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use intellifill_pipeline::QueueKind;
use intellifill_queue::{QueueHealth, QueueMetrics};

use super::open_runtime;
use crate::settings::Settings;

/// Arguments for the stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Only this queue (knowledge, ocr, document, batch)
    #[arg(short, long)]
    queue: Option<String>,

    /// Prometheus text exposition instead of a table
    #[arg(long)]
    prometheus: bool,
}

fn selected(queue: Option<&str>) -> Result<Vec<QueueKind>> {
    match queue {
        None => Ok(QueueKind::ALL.to_vec()),
        Some(name) => match QueueKind::parse(name) {
            Some(kind) => Ok(vec![kind]),
            None => bail!("Unknown queue '{}'", name),
        },
    }
}

pub async fn run(args: StatsArgs, settings: Settings) -> Result<()> {
    let kinds = selected(args.queue.as_deref())?;
    let (db, runtime) = open_runtime(&settings).await?;

    let mut rows = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let metrics = runtime.queue(kind)?.metrics(settings.metrics_window).await?;
        let health = metrics.health(&settings.health);
        rows.push((metrics, health));
    }
    db.close().await;

    if args.prometheus {
        for (metrics, _) in &rows {
            print!("{}", metrics.to_prometheus());
        }
        return Ok(());
    }

    print_table(&rows);
    Ok(())
}

fn print_table(rows: &[(QueueMetrics, QueueHealth)]) {
    println!("{}", "Queue Stats".bold().cyan());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            [
                "Queue", "Waiting", "Active", "Delayed", "Completed", "Failed", "Avg ms",
                "Fail rate", "Health",
            ]
            .map(|h| Cell::new(h).fg(Color::Cyan)),
        );

    for (metrics, health) in rows {
        let counts = &metrics.counts;
        let verdict = if health.healthy {
            Cell::new("healthy").fg(Color::Green)
        } else {
            Cell::new(health.reasons.join("; ")).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&metrics.queue).fg(Color::Green),
            Cell::new(counts.waiting),
            Cell::new(counts.active),
            Cell::new(counts.delayed),
            Cell::new(counts.completed),
            Cell::new(counts.failed),
            Cell::new(format!("{:.0}", metrics.avg_processing_ms)),
            Cell::new(format!("{:.1}%", metrics.failure_rate * 100.0)),
            verdict,
        ]);
    }

    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_selection() {
        assert_eq!(selected(None).unwrap().len(), 4);
        assert_eq!(selected(Some("ocr")).unwrap(), vec![QueueKind::Ocr]);
        assert_eq!(
            selected(Some("batch-processing")).unwrap(),
            vec![QueueKind::Batch]
        );
        assert!(selected(Some("email")).is_err());
    }
}
