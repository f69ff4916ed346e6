use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use toolnest_core::{Action, Catalog, InstalledRecord};
use toolnest_installer::ErrorClass;
use toolnest_resolver::{version_direction, Reconciliation, VersionDirection};

use crate::session::{ActionFailure, ActionOutcome, SessionObserver, SessionReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

pub fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    fn start_download_bar(self, label: &str) -> Option<ProgressBar> {
        if self.style != OutputStyle::Rich {
            return None;
        }

        let progress_bar = ProgressBar::new(1);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<16} [{bar:24.cyan/blue}] {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} {eta}",
        ) {
            progress_bar.set_style(
                style
                    .tick_chars(".oO@* ")
                    .progress_chars("=>-"),
            );
        }
        progress_bar.set_message(label.to_string());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        Some(progress_bar)
    }
}

/// Prints session progress: one status line per action, plus a byte
/// progress bar for downloads in rich mode.
pub struct SessionView {
    renderer: TerminalRenderer,
    progress: Mutex<Option<ProgressBar>>,
}

impl SessionView {
    pub fn new(renderer: TerminalRenderer) -> Self {
        Self {
            renderer,
            progress: Mutex::new(None),
        }
    }

    fn replace_bar(&self, next: Option<ProgressBar>) {
        let Ok(mut slot) = self.progress.lock() else {
            return;
        };
        if let Some(previous) = std::mem::replace(&mut *slot, next) {
            previous.finish_and_clear();
        }
    }
}

impl SessionObserver for SessionView {
    fn action_started(&self, index: usize, total: usize, action: &Action) {
        self.renderer.print_status(
            "step",
            &format!("({}/{}) {}", index + 1, total, describe_action(action)),
        );
        if !action.is_remove() {
            self.replace_bar(self.renderer.start_download_bar(action.name()));
        }
    }

    fn download_progress(&self, _action: &Action, downloaded: u64, total: u64) {
        let Ok(slot) = self.progress.lock() else {
            return;
        };
        if let Some(progress_bar) = slot.as_ref() {
            let safe_total = total.max(1);
            progress_bar.set_length(safe_total);
            progress_bar.set_position(downloaded.min(safe_total));
        }
    }

    fn action_succeeded(&self, outcome: &ActionOutcome) {
        self.replace_bar(None);
        self.renderer
            .print_status("ok", &render_outcome_line(outcome));
    }

    fn action_failed(&self, failure: &ActionFailure) {
        self.replace_bar(None);
        self.renderer
            .print_status("error", &render_failure_line(failure));
    }
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "error" => "[ERR]",
                _ => "[..]",
            };
            format!("{badge} {message}")
        }
    }
}

/// Human-readable verb phrase; upgrades to a lower version read as a
/// downgrade.
pub fn describe_action(action: &Action) -> String {
    match action {
        Action::Install { name, version } => format!("Install {name} v{version}"),
        Action::Upgrade {
            name,
            from_version,
            to_version,
        } => {
            let verb = match version_direction(from_version, to_version) {
                VersionDirection::Downgrade => "Downgrade",
                VersionDirection::Upgrade | VersionDirection::Unordered => "Upgrade",
            };
            format!("{verb} {name} from v{from_version} to v{to_version}")
        }
        Action::Remove { name, version } => format!("Remove {name} v{version}"),
    }
}

pub fn render_outcome_line(outcome: &ActionOutcome) -> String {
    let took = format_elapsed(outcome.elapsed);
    match &outcome.action {
        Action::Install { name, version } => format!(
            "installed {name} v{version} ({} in {took})",
            format_size(outcome.bytes)
        ),
        Action::Upgrade {
            name, to_version, ..
        } => format!(
            "updated {name} to v{to_version} ({} in {took})",
            format_size(outcome.bytes)
        ),
        Action::Remove { name, version } => format!("removed {name} v{version}"),
    }
}

pub fn render_failure_line(failure: &ActionFailure) -> String {
    format!(
        "{} failed [{}]: {}",
        describe_action(&failure.action),
        failure.class.as_str(),
        failure.reason
    )
}

/// Catalog packages in catalog order, then local packages slated for
/// removal.
pub fn render_plan_lines(catalog: &Catalog, plan: &Reconciliation) -> Vec<String> {
    let mut rows: Vec<[String; 4]> = Vec::new();
    for package in catalog.packages() {
        let status = match plan.action_for(&package.name) {
            Some(Action::Install { version, .. }) => format!("v{version} (install)"),
            Some(Action::Upgrade {
                from_version,
                to_version,
                ..
            }) => match version_direction(from_version, to_version) {
                VersionDirection::Downgrade => {
                    format!("v{from_version} -> v{to_version} (downgrade)")
                }
                VersionDirection::Upgrade | VersionDirection::Unordered => {
                    format!("v{from_version} -> v{to_version}")
                }
            },
            _ => format!("v{} (current)", package.version),
        };
        rows.push([
            (rows.len() + 1).to_string(),
            package.name.clone(),
            status,
            package.description.clone(),
        ]);
    }
    for action in plan.actions.iter().filter(|action| action.is_remove()) {
        if let Action::Remove { name, version } = action {
            rows.push([
                (rows.len() + 1).to_string(),
                name.clone(),
                format!("v{version} (remove)"),
                "no longer in the catalog".to_string(),
            ]);
        }
    }

    let header = [
        "#".to_string(),
        "Name".to_string(),
        "Version / Status".to_string(),
        "Description".to_string(),
    ];
    let width = |column: usize| {
        rows.iter()
            .chain(std::iter::once(&header))
            .map(|row| row[column].chars().count())
            .max()
            .unwrap_or(0)
    };
    let (index_width, name_width, status_width) = (width(0), width(1), width(2));

    std::iter::once(&header)
        .chain(rows.iter())
        .map(|row| {
            format!(
                "{:>index_width$}  {:<name_width$}  {:<status_width$}  {}",
                row[0], row[1], row[2], row[3]
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

pub fn render_action_lines(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .map(|action| format!("- {}", describe_action(action)))
        .collect()
}

pub fn render_session_summary_lines(report: &SessionReport) -> Vec<String> {
    let mut lines = vec![
        format!("Total packages: {}", report.installed_count()),
        format!("Total size: {}", format_size(report.total_bytes())),
        format!("Time elapsed: {}", format_elapsed(report.elapsed)),
    ];
    if report.removed_count() > 0 {
        lines.insert(1, format!("Removed: {}", report.removed_count()));
    }
    if report.cancelled_count() > 0 {
        lines.push(format!("Cancelled: {}", report.cancelled_count()));
    }
    for failure in report
        .failed
        .iter()
        .filter(|failure| failure.class != ErrorClass::Cancelled)
    {
        lines.push(format!(
            "Failed: {} ({}): {}",
            failure.action.name(),
            failure.class.as_str(),
            failure.reason
        ));
    }
    lines.extend(
        report
            .warnings
            .iter()
            .map(|warning| format!("Warning: {warning}")),
    );
    lines
}

/// `catalog` is `None` when it could not be fetched; the status column is
/// left out in that case.
pub fn render_list_lines(records: &[InstalledRecord], catalog: Option<&Catalog>) -> Vec<String> {
    if records.is_empty() {
        return vec!["No packages installed".to_string()];
    }

    let name_width = records
        .iter()
        .map(|record| record.name.chars().count())
        .max()
        .unwrap_or(0);
    let version_width = records
        .iter()
        .map(|record| record.version.chars().count() + 1)
        .max()
        .unwrap_or(0);

    records
        .iter()
        .map(|record| {
            let updates = match record.update_count {
                0 => "installed".to_string(),
                1 => "1 update".to_string(),
                count => format!("{count} updates"),
            };
            let status = catalog.map(|catalog| match catalog.get(&record.name) {
                Some(package) if package.version == record.version => "current".to_string(),
                Some(package) => format!("catalog has v{}", package.version),
                None => "not in catalog".to_string(),
            });
            let mut line = format!(
                "{:<name_width$}  {:<version_width$}  {updates}",
                record.name,
                format!("v{}", record.version),
            );
            if let Some(status) = status {
                line.push_str(&format!("  [{status}]"));
            }
            line
        })
        .collect()
}

/// `1536` becomes `1.5 KB`; whole values drop the fraction.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB"] {
        if value < 1024.0 {
            return format!("{} {unit}", trim_fraction(value));
        }
        value /= 1024.0;
    }
    format!("{} GB", trim_fraction(value))
}

/// Tenth-of-a-second resolution: `42s`, `3.5s`, `2m 5.3s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let tenths = (elapsed.as_millis() + 50) / 100;
    let render = |tenths: u128| {
        if tenths % 10 == 0 {
            format!("{}s", tenths / 10)
        } else {
            format!("{}.{}s", tenths / 10, tenths % 10)
        }
    };
    if tenths < 600 {
        return render(tenths);
    }
    format!("{}m {}", tenths / 600, render(tenths % 600))
}

fn trim_fraction(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{value:.1}")
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}
