use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use riftpatch_core::{UpdateError, UpdateProgress, UpdateStage};
use riftpatch_engine::{format_bytes, ManifestOrigin, RunSummary};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// Renders engine progress. Shared with the update worker through the
/// progress sink.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    progress_bar: Option<ProgressBar>,
    last_stage: Option<UpdateStage>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if self.style == OutputStyle::Rich {
            println!("{}", colorize(section_style(), &format!("== {title} ==")));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn print_error(self, err: &UpdateError) {
        for line in format_error_lines(err, self.style) {
            eprintln!("{line}");
        }
    }

    pub(crate) fn start_progress(self) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} [{bar:24.cyan/blue}] {pos:>3}% {elapsed_precise} {wide_msg}",
            ) {
                progress_bar.set_style(style.tick_chars("<^>v ").progress_chars("=>-"));
            }
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            progress_bar,
            last_stage: None,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn observe(&mut self, progress: &UpdateProgress) {
        let stage_changed = self.last_stage != Some(progress.stage);
        self.last_stage = Some(progress.stage);

        match &self.progress_bar {
            Some(progress_bar) => {
                progress_bar.set_position(progress.percent.round() as u64);
                progress_bar.set_message(render_progress_message(progress));
            }
            None if stage_changed => {
                println!("{:>3}% {}", progress.percent.round() as u64, progress.headline);
            }
            None => {}
        }
    }

    pub(crate) fn finish_success(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
            println!(
                "{} complete in {}",
                colorize(progress_label_style(), "update"),
                format_elapsed(self.started_at.elapsed())
            );
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.abandon();
        }
        if self.style == OutputStyle::Rich {
            println!();
        }
    }
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal(), std::io::stderr().is_terminal())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn render_progress_message(progress: &UpdateProgress) -> String {
    if progress.detail.is_empty() {
        progress.headline.clone()
    } else {
        format!("{}: {}", progress.headline, progress.detail)
    }
}

pub(crate) fn format_summary_lines(summary: &RunSummary, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if summary.recovered {
        lines.push(render_status_line(
            style,
            "warn",
            "rolled back an interrupted update",
        ));
    }
    if summary.manifest_origin == ManifestOrigin::Cache {
        lines.push(render_status_line(
            style,
            "warn",
            "update server unreachable, used cached manifest",
        ));
    }
    for path in &summary.orphans_removed {
        lines.push(render_status_line(style, "step", &format!("removed {path}")));
    }
    if summary.downloaded > 0 {
        lines.push(render_status_line(
            style,
            "step",
            &format!(
                "downloaded {} file(s), {} transferred",
                summary.downloaded,
                format_bytes(summary.wire_bytes)
            ),
        ));
    }
    lines.push(render_status_line(
        style,
        "ok",
        &format!(
            "version {} is ready ({} verified, {} updated)",
            summary.manifest_version, summary.verified, summary.applied
        ),
    ));
    lines
}

pub(crate) fn format_error_lines(err: &UpdateError, style: OutputStyle) -> Vec<String> {
    if err.is_cancelled() {
        return vec![render_status_line(style, "warn", err.headline())];
    }

    let hint = match err {
        UpdateError::TransactionPending | UpdateError::TransactionConflict { .. } => {
            "run `riftpatch recover` to roll back the interrupted update"
        }
        _ => "run `riftpatch repair` to retry with a full check",
    };
    vec![
        render_status_line(style, "err", err.headline()),
        format!("  {}", err.detail()),
        format!("  hint: {hint}"),
    ]
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
