use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use instill_installer::{ActionHooks, PlannedAction, SystemLayout};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()),
    )
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "step" => "[..]",
        _ => "[--]",
    }
}

fn badge_color(status: &str) -> AnsiColor {
    match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "err" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlack,
    }
}

fn bold(color: AnsiColor) -> Style {
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{text}{}", style.render(), style.render_reset())
}

/// One line of user-facing output. Plain output carries no badge so it stays
/// stable for scripts.
pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

/// Summary printed once a progress bar closes. Plain output has none.
pub(crate) fn render_progress_summary(
    style: OutputStyle,
    label: &str,
    applied: u64,
    elapsed: Duration,
) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(render_status_line(
            style,
            "ok",
            &format!("{label}: {applied} action(s) in {}", HumanDuration(elapsed)),
        )),
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        match self.style {
            OutputStyle::Plain => println!("{message}"),
            OutputStyle::Rich => println!(
                "{} {message}",
                colorize(bold(badge_color(status)), status_badge(status))
            ),
        }
    }

    pub(crate) fn print_section(self, title: &str) {
        if self.style == OutputStyle::Rich {
            println!();
            println!(
                "{}",
                colorize(bold(AnsiColor::BrightBlue), &format!("== {title} =="))
            );
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let bar = (self.style == OutputStyle::Rich).then(|| {
            let bar = ProgressBar::new(total.max(1));
            if let Ok(template) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<10} [{bar:24.cyan/blue}] {pos:>3}/{len:3} {wide_msg}",
            ) {
                bar.set_style(template.progress_chars("=>-"));
            }
            bar.set_message(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            applied: 0,
            bar,
            started_at: Instant::now(),
        }
    }
}

/// Action counter for one session, drawn as a bar in rich output.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    applied: u64,
    bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalProgress {
    fn advance(&mut self, action: &str) {
        self.applied += 1;
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("{:<10} {action}", self.label));
        }
    }

    pub(crate) fn finish_success(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        if let Some(line) = render_progress_summary(
            self.style,
            &self.label,
            self.applied,
            self.started_at.elapsed(),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

/// Feeds emitter callbacks into a progress bar and remembers components the
/// emitter gave up on.
pub(crate) struct ProgressHooks {
    progress: TerminalProgress,
    layout: SystemLayout,
    skipped: Vec<(String, String)>,
}

impl ProgressHooks {
    pub(crate) fn new(progress: TerminalProgress, layout: &SystemLayout) -> Self {
        Self {
            progress,
            layout: layout.clone(),
            skipped: Vec::new(),
        }
    }

    /// Ends the bar; returns `(component, reason)` for every skipped component.
    pub(crate) fn finish(self, succeeded: bool) -> Vec<(String, String)> {
        if succeeded {
            self.progress.finish_success();
        } else {
            self.progress.finish_abandon();
        }
        self.skipped
    }
}

impl ActionHooks for ProgressHooks {
    fn after_action(&mut self, _index: usize, action: &PlannedAction) {
        self.progress.advance(&action.describe(&self.layout));
    }

    fn component_skipped(&mut self, component: &str, reason: &str) {
        self.skipped.push((component.to_string(), reason.to_string()));
    }
}
