use std::io::Write;

use autobib_core::{EntryOutcome, EntryStatus};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn status_label(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Processed => "PROCESSED",
        EntryStatus::Downloaded => "DOWNLOADED",
        EntryStatus::Unmatched => "NOT FOUND",
        EntryStatus::Unsupported => "UNSUPPORTED",
        EntryStatus::Failed => "FAILED",
    }
}

fn colored_label(status: EntryStatus, color: ColorMode) -> String {
    let label = status_label(status);
    if !color.enabled() {
        return label.to_string();
    }
    match status {
        EntryStatus::Processed | EntryStatus::Downloaded => label.green().to_string(),
        EntryStatus::Unmatched => label.yellow().to_string(),
        EntryStatus::Unsupported => label.dimmed().to_string(),
        EntryStatus::Failed => label.red().to_string(),
    }
}

/// Print one block per entry, in input order.
pub fn print_report(
    w: &mut dyn Write,
    outcomes: &[EntryOutcome],
    color: ColorMode,
) -> std::io::Result<()> {
    let total = outcomes.len();
    for (i, outcome) in outcomes.iter().enumerate() {
        let heading = match &outcome.author {
            Some(author) => format!("{author}, {}", truncate(&outcome.title, 60)),
            None => truncate(&outcome.title, 60),
        };
        let label = colored_label(outcome.status, color);
        if color.enabled() {
            writeln!(w, "[{}/{}] {} {}", i + 1, total, label, heading.bold())?;
        } else {
            writeln!(w, "[{}/{}] {} {}", i + 1, total, label, heading)?;
        }

        if let Some(ref path) = outcome.output {
            writeln!(w, "  File:  {}", path.display())?;
        }
        if let Some(ref ark) = outcome.ark {
            writeln!(w, "  Ark:   {}", ark)?;
        }
        if let Some(score) = outcome.score {
            writeln!(w, "  Score: {:.2}", score)?;
        }
        if let Some(ref err) = outcome.error {
            if color.enabled() {
                writeln!(w, "  {}", err.dimmed())?;
            } else {
                writeln!(w, "  {}", err)?;
            }
        }
    }
    Ok(())
}

/// Print the final counts.
pub fn print_summary(
    w: &mut dyn Write,
    outcomes: &[EntryOutcome],
    color: ColorMode,
) -> std::io::Result<()> {
    let count = |s: EntryStatus| outcomes.iter().filter(|o| o.status == s).count();
    let retrieved = outcomes.iter().filter(|o| o.status.is_success()).count();
    let unmatched = count(EntryStatus::Unmatched);
    let unsupported = count(EntryStatus::Unsupported);
    let failed = count(EntryStatus::Failed);

    writeln!(w)?;
    let sep = "=".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", "SUMMARY".bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "SUMMARY")?;
        writeln!(w, "{}", sep)?;
    }
    writeln!(w, "  Entries: {}", outcomes.len())?;

    if color.enabled() {
        writeln!(w, "  {} {}", "Retrieved:".green(), retrieved)?;
    } else {
        writeln!(w, "  Retrieved: {}", retrieved)?;
    }
    if unmatched > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Not found:".yellow(), unmatched)?;
        } else {
            writeln!(w, "  Not found: {}", unmatched)?;
        }
    }
    if unsupported > 0 {
        let msg = format!("Unsupported entry kinds: {}", unsupported);
        if color.enabled() {
            writeln!(w, "  {}", msg.dimmed())?;
        } else {
            writeln!(w, "  {}", msg)?;
        }
    }
    if failed > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Failed:".red(), failed)?;
        } else {
            writeln!(w, "  Failed: {}", failed)?;
        }
    }
    writeln!(w)?;
    Ok(())
}

/// Truncate to `max` characters, appending `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
