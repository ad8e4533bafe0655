//! Spinner for long-running solves with a plain fallback for CI

use crate::engine::ProgressFn;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

const MAX_LINE: usize = 60;

/// Shows the latest command output line next to a spinner
#[derive(Clone)]
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    /// Spinner on interactive terminals, a single plain line otherwise
    pub fn new(label: &str) -> Self {
        Self::with_interactive(label, std::io::stderr().is_terminal())
    }

    pub fn with_interactive(label: &str, interactive: bool) -> Self {
        let bar = if interactive {
            let bar = ProgressBar::new_spinner();
            let template = ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {prefix}  {msg:.dim}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");
            bar.set_style(template);
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            eprintln!("{} {}", style("...").dim(), label);
            None
        };
        Self { bar }
    }

    /// Record one output line
    pub fn on_line(&self, line: &str) {
        let Some(bar) = &self.bar else {
            return;
        };
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            bar.set_message(truncate(trimmed));
        }
    }

    /// Callback for the engine
    pub fn progress_fn(&self) -> ProgressFn {
        let this = self.clone();
        Arc::new(move |line: String| this.on_line(&line))
    }

    pub fn finish(&self, message: &str) {
        match &self.bar {
            Some(bar) => {
                bar.finish_and_clear();
                eprintln!("{} {}", style("✓").green(), message);
            }
            None => eprintln!("{} {}", style("[OK]").green(), message),
        }
    }

    pub fn fail(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Shorten a line to the display width, respecting char boundaries
fn truncate(line: &str) -> String {
    if line.chars().count() <= MAX_LINE {
        return line.to_string();
    }
    let head: String = line.chars().take(MAX_LINE - 3).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_ignores_lines() {
        let progress = BuildProgress::with_interactive("Building", false);
        (progress.progress_fn())("go: downloading golang.org/x/mod v0.17.0".to_string());
        progress.finish("done");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let long = "é".repeat(80);
        let short = truncate(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), MAX_LINE);
        assert_eq!(truncate("short"), "short");
    }
}
