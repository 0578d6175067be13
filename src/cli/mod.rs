//! permit-pilot CLI output
//!
//! Colors, status badges and the batch report.

use console::{style, Style};

use crate::batch::{BatchItem, BatchSummary};
use crate::core::{Checkpoint, Step};
use crate::queue::{QueueItem, QueueStatus};

pub const BANNER_TEXT: &str = r#"
  ___              _ _     ___ _ _     _
 | _ \___ _ _ _ __(_) |_  | _ (_) |___| |_
 |  _/ -_) '_| '  \ |  _| |  _/ | / _ \  _|
 |_| \___|_| |_|_|_|_|\__| |_| |_|_\___/\__|
"#;

pub fn print_banner() {
    println!("{}", style(BANNER_TEXT).cyan().bold());
    println!(
        "{}",
        style(format!("  Express mechanical permits, filed for you  ·  v{}", env!("CARGO_PKG_VERSION"))).dim()
    );
    println!();
}

pub fn print_info(msg: &str) {
    println!("{} {}", style("ℹ").cyan(), msg);
}

pub fn print_success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

pub fn print_error(msg: &str) {
    println!("{} {}", style("✗").red().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

fn status_style(status: QueueStatus) -> Style {
    match status {
        QueueStatus::Submitted => Style::new().green().bold(),
        QueueStatus::AwaitingPayment | QueueStatus::PaymentReceived => Style::new().yellow(),
        QueueStatus::Queued => Style::new().cyan(),
        QueueStatus::Failed => Style::new().red(),
        QueueStatus::ManualReview => Style::new().red().bold(),
    }
}

/// Plain one-line description of a batch item
pub fn item_line(item: &BatchItem) -> String {
    let mut line = format!("{} (attempt {})", item.submission_id, item.attempts);
    if let Some(permit) = &item.permit_number {
        line.push_str(&format!(" permit {}", permit));
    } else if let Some(step) = item.final_step {
        if item.status != QueueStatus::Submitted {
            line.push_str(&format!(" at {}", step.title()));
        }
    }
    if let Some(error) = &item.error {
        line.push_str(&format!(" - {}", error));
    }
    line
}

pub fn print_summary(summary: &BatchSummary) {
    println!();
    println!("{}", style("════════════════════════════════════════════════════════════").dim());
    let title = if summary.dry_run { "PENDING SUBMISSIONS (dry run)" } else { "BATCH SUMMARY" };
    println!("{}", style(title).cyan().bold());
    println!("{}", style("────────────────────────────────────────────────────────────").dim());

    if summary.items.is_empty() {
        print_info("Nothing pending");
    }

    for (i, item) in summary.items.iter().enumerate() {
        let badge = format!("[{}]", item.status.as_str().to_uppercase());
        println!(
            "{} {} {}",
            style(format!("[{}/{}]", i + 1, summary.total())).dim(),
            status_style(item.status).apply_to(badge),
            item_line(item)
        );
    }

    if summary.dry_run {
        return;
    }

    println!("{}", style("────────────────────────────────────────────────────────────").dim());
    println!(
        "Total: {}  Submitted: {}  Awaiting payment: {}  Failed: {}  Manual review: {}",
        summary.total(),
        style(summary.count(QueueStatus::Submitted)).green(),
        style(summary.count(QueueStatus::AwaitingPayment)).yellow(),
        style(summary.count(QueueStatus::Failed)).red(),
        style(summary.count(QueueStatus::ManualReview)).red().bold(),
    );
    if let Some(reason) = &summary.stopped_early {
        print_warning(&format!("Batch stopped early: {}", reason));
    }
}

/// Checkpoint and queue row for `status <id>`
pub fn print_status(checkpoint: Option<&Checkpoint>, item: Option<&QueueItem>) {
    if let Some(item) = item {
        let badge = format!("[{}]", item.status.as_str().to_uppercase());
        println!("{} {} ({} attempts)", status_style(item.status).apply_to(badge), item.id, item.attempts);
        if let Some(error) = &item.last_error {
            println!("  Last error: {}", style(error).red());
        }
    }

    let Some(cp) = checkpoint else {
        print_info("No checkpoint yet; the submission has not started");
        return;
    };

    let progress = match cp.current_step.number() {
        Some(n) => format!("step {} of 10", n + 1),
        None if cp.current_step == Step::Complete => "done".to_string(),
        None => "paused".to_string(),
    };
    println!("  Current step: {} ({})", style(cp.current_step.title()).bold(), progress);
    println!("  Updated: {}", cp.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    for (key, value) in &cp.state.data {
        println!("  {}: {}", style(key).dim(), value);
    }
    for error in &cp.state.errors {
        println!("  {} {}", style("error").red(), error);
    }
}
