//! Progress reporting and result output.
//!
//! The pipeline emits events to a [`Reporter`] as cases move through it:
//!
//! | Event                   | When                                         |
//! |-------------------------|----------------------------------------------|
//! | `on_cases_discovered`   | before the first batch is read               |
//! | `on_inputs_sent`        | after each batch upload                      |
//! | `on_run_complete`       | the supervisor answered for a case           |
//! | `on_case_done`          | a case has its final verdict or error        |
//! | `on_pipeline_complete`  | all cases are done                           |

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use console::{Alignment, StyledObject, measure_text_width, pad_str, style};

use crate::diff::render::{self, Row};
use crate::diff::{self, Strategy};
use crate::pipeline::{CaseReport, RunSummary, TestCase, Verdict, VerdictKind};

/// Receives pipeline events.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_cases_discovered(&self, cases: &[TestCase]);

    /// `count` inputs were uploaded in one batch.
    async fn on_inputs_sent(&self, count: usize);

    async fn on_run_complete(&self, case: &TestCase);

    async fn on_case_done(&self, report: &CaseReport);

    async fn on_pipeline_complete(&self, summary: &RunSummary);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_cases_discovered(&self, _cases: &[TestCase]) {}
    async fn on_inputs_sent(&self, _count: usize) {}
    async fn on_run_complete(&self, _case: &TestCase) {}
    async fn on_case_done(&self, _report: &CaseReport) {}
    async fn on_pipeline_complete(&self, _summary: &RunSummary) {}
}

/// Running counters of pipeline progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    /// Inputs uploaded.
    pub sent: usize,
    /// Runs answered by the supervisor.
    pub tested: usize,
    /// Cases with a final outcome.
    pub done: usize,
    pub by_kind: BTreeMap<VerdictKind, usize>,
}

impl Progress {
    fn message(&self) -> String {
        let mut parts = vec![
            format!("{} sent", self.sent),
            format!("{} tested", self.tested),
        ];
        for (kind, count) in &self.by_kind {
            parts.push(format!("{} {}", count, kind_label(*kind).to_lowercase()));
        }
        parts.join(", ")
    }
}

fn kind_label(kind: VerdictKind) -> &'static str {
    match kind {
        VerdictKind::Success | VerdictKind::Completed => "Success",
        VerdictKind::WrongAnswer => "Wrong answer",
        VerdictKind::RuntimeError => "Runtime error",
        VerdictKind::Timeout => "Timeout",
        VerdictKind::Error => "Error",
    }
}

fn status(kind: VerdictKind) -> StyledObject<String> {
    let text = kind_label(kind).to_string();
    match kind {
        VerdictKind::Success | VerdictKind::Completed => style(format!("✔ {}", text)).green(),
        VerdictKind::WrongAnswer => style(format!("✖ {}", text)).red(),
        VerdictKind::RuntimeError => style(format!("✖ {}", text)).red().bold(),
        VerdictKind::Timeout => style(format!("⚠ {}", text)).yellow(),
        VerdictKind::Error => style(format!("✖ {}", text)).red().bold(),
    }
}

/// Console reporter: a progress bar while running, then a result table.
pub struct ConsoleReporter {
    progress_bar: Mutex<Option<indicatif::ProgressBar>>,
    progress: Mutex<Progress>,
    time_limit_secs: f64,
    strategy: Strategy,
    hide_success: bool,
}

impl ConsoleReporter {
    pub fn new(time_limit_secs: f64, strategy: Strategy) -> Self {
        Self {
            progress_bar: Mutex::new(None),
            progress: Mutex::new(Progress::default()),
            time_limit_secs,
            strategy,
            hide_success: false,
        }
    }

    /// Leaves passing cases out of the result table.
    pub fn hide_success(mut self, hide: bool) -> Self {
        self.hide_success = hide;
        self
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn update(&self, apply: impl FnOnce(&mut Progress)) {
        let Ok(mut progress) = self.progress.lock() else {
            return;
        };
        apply(&mut progress);
        if let Ok(bar) = self.progress_bar.lock() {
            if let Some(bar) = bar.as_ref() {
                bar.set_position(progress.done as u64);
                bar.set_message(progress.message());
            }
        }
    }

    fn format_time(&self, time: f64) -> String {
        let text = format!("{:.3}s", time);
        let ratio = if self.time_limit_secs > 0.0 {
            time / self.time_limit_secs
        } else {
            0.0
        };
        if ratio >= 0.8 {
            style(text).red().to_string()
        } else if ratio >= 0.5 {
            style(text).yellow().to_string()
        } else {
            style(text).dim().to_string()
        }
    }

    /// Renders the result table and failure details.
    pub fn render_summary(&self, summary: &RunSummary) -> String {
        let mut out = Vec::new();

        let shown: Vec<&CaseReport> = summary
            .reports
            .iter()
            .filter(|r| !(self.hide_success && r.passed()))
            .collect();

        if !shown.is_empty() {
            let id_width = shown
                .iter()
                .map(|r| measure_text_width(&r.case.id))
                .max()
                .unwrap_or(0)
                .max(4);

            out.push(format!(
                "{}  {}  {}",
                style(pad_str("File", id_width, Alignment::Left, None)).bold(),
                style(pad_str("Status", 16, Alignment::Left, None)).bold(),
                style("Time").bold()
            ));
            for report in &shown {
                let time = match &report.outcome {
                    Ok(verdict) => verdict.time().map(|t| self.format_time(t)),
                    Err(_) => None,
                };
                let status = status(report.kind()).to_string();
                out.push(format!(
                    "{}  {}  {}",
                    pad_str(&report.case.id, id_width, Alignment::Left, None),
                    pad_str(&status, 16, Alignment::Left, None),
                    time.unwrap_or_default()
                ));
            }
        }

        if self.hide_success && summary.passed > 0 {
            out.push(
                style(format!("{} successful tests hidden", summary.passed))
                    .dim()
                    .to_string(),
            );
        }

        for report in shown.iter().filter(|r| !r.passed()) {
            let details = self.render_details(report);
            if !details.is_empty() {
                out.push(String::new());
                out.push(format!("{} {}", style("──").dim(), style(&report.case.id).bold()));
                out.extend(details);
            }
        }

        out.push(String::new());
        out.push(summary_line(summary));
        out.join("\n")
    }

    fn render_details(&self, report: &CaseReport) -> Vec<String> {
        match &report.outcome {
            Ok(Verdict::WrongAnswer {
                expected, actual, ..
            }) => {
                if !render::fits(expected, actual) {
                    return vec![style("Output is too long to show").dim().to_string()];
                }
                let chunks = diff::chunks(self.strategy, expected, actual);
                format_diff(&render::rows(&chunks))
            }
            Ok(Verdict::RuntimeError { message, stderr }) => {
                let mut lines = vec![style(message).red().bold().to_string()];
                if let Some(stderr) = stderr.as_deref().filter(|s| !s.trim().is_empty()) {
                    lines.extend(stderr.lines().map(|l| style(l).dim().to_string()));
                }
                lines
            }
            Ok(Verdict::Timeout) => vec![
                style(format!(
                    "⚠ Time limit exceeded ({}s)",
                    self.time_limit_secs
                ))
                .yellow()
                .to_string(),
            ],
            Ok(_) => Vec::new(),
            Err(e) => vec![style(e.to_string()).red().to_string()],
        }
    }
}

fn summary_line(summary: &RunSummary) -> String {
    let mut parts = vec![style(format!("{} passed", summary.passed)).green().to_string()];
    for (count, label) in [
        (summary.wrong_answer, "wrong answer"),
        (summary.runtime_error, "runtime error"),
        (summary.timeout, "timeout"),
        (summary.errors, "error"),
    ] {
        if count > 0 {
            parts.push(style(format!("{} {}", count, label)).red().to_string());
        }
    }
    format!(
        "{} of {} in {:.2?}",
        parts.join(", "),
        summary.total,
        summary.duration
    )
}

/// Lays diff rows out as a two-sided table.
pub fn format_diff(rows: &[Row]) -> Vec<String> {
    let number_width = rows
        .iter()
        .map(|row| match row {
            Row::Same {
                expected_line,
                actual_line,
                ..
            }
            | Row::Substituted {
                expected_line,
                actual_line,
                ..
            } => (*expected_line).max(*actual_line),
            Row::Missing { expected_line, .. } => *expected_line,
            Row::Extra { actual_line, .. } => *actual_line,
            Row::Hidden { .. } => 0,
        })
        .max()
        .unwrap_or(0)
        .to_string()
        .len();

    let text_width = rows
        .iter()
        .map(|row| match row {
            Row::Same { text, .. } => measure_text_width(text),
            Row::Substituted { expected, .. } | Row::Missing { expected, .. } => {
                measure_text_width(expected)
            }
            _ => 0,
        })
        .max()
        .unwrap_or(0)
        .clamp(8, 60);

    let number = |n: Option<usize>| {
        let text = n.map(|n| n.to_string()).unwrap_or_default();
        style(pad_str(&text, number_width, Alignment::Right, None).into_owned()).dim()
    };
    let cell = |text: &str| pad_str(text, text_width, Alignment::Left, Some("…")).into_owned();

    let mut table = vec![format!(
        "{} {} {} {} {}",
        number(None),
        style(cell("Expected")).bold(),
        " ",
        number(None),
        style("Actual").bold()
    )];

    table.extend(rows.iter().map(|row| match row {
        Row::Same {
            expected_line,
            actual_line,
            text,
        } => format!(
            "{} {}   {} {}",
            number(Some(*expected_line)),
            cell(text),
            number(Some(*actual_line)),
            text
        ),
        Row::Substituted {
            expected_line,
            expected,
            actual_line,
            actual,
        } => format!(
            "{} {} {} {} {}",
            number(Some(*expected_line)),
            style(cell(expected)).green(),
            style(row.marker()).yellow().bold(),
            number(Some(*actual_line)),
            style(actual).red()
        ),
        Row::Missing {
            expected_line,
            expected,
        } => format!(
            "{} {} {} {} {}",
            number(Some(*expected_line)),
            style(cell(expected)).green(),
            style(row.marker()).red().bold(),
            number(None),
            style("Line missing").red().dim()
        ),
        Row::Extra {
            actual_line,
            actual,
        } => format!(
            "{} {} {} {} {}",
            number(None),
            cell(""),
            style(row.marker()).red().bold(),
            number(Some(*actual_line)),
            style(actual).red()
        ),
        Row::Hidden { count } => format!(
            "{} {}",
            number(None),
            style(format!("⋯ {} lines hidden", count)).dim()
        ),
    }));

    table
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_cases_discovered(&self, cases: &[TestCase]) {
        let pb = indicatif::ProgressBar::new(cases.len() as u64);
        if let Ok(template) = indicatif::ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            pb.set_style(template.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Progress {
                total: cases.len(),
                ..Default::default()
            };
        }
        if let Ok(mut bar) = self.progress_bar.lock() {
            *bar = Some(pb);
        }
    }

    async fn on_inputs_sent(&self, count: usize) {
        self.update(|p| p.sent += count);
    }

    async fn on_run_complete(&self, _case: &TestCase) {
        self.update(|p| p.tested += 1);
    }

    async fn on_case_done(&self, report: &CaseReport) {
        self.update(|p| {
            p.done += 1;
            *p.by_kind.entry(report.kind()).or_default() += 1;
        });
    }

    async fn on_pipeline_complete(&self, summary: &RunSummary) {
        if let Ok(mut bar) = self.progress_bar.lock() {
            if let Some(pb) = bar.take() {
                pb.finish_and_clear();
            }
        }

        println!("{}", self.render_summary(summary));
    }
}
