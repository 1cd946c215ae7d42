use super::{Report, ReportError, Section};
use crate::sample::format_rfc3339;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

const PALETTE: [&str; 6] = [
    "#667eea", "#764ba2", "#f093fb", "#f5576c", "#4facfe", "#00f2fe",
];

const CHART_WIDTH: f64 = 760.0;
const CHART_HEIGHT: f64 = 240.0;
const CHART_PAD: f64 = 40.0;

const REPORT_PREFIX: &str = "system_report_";
const REPORT_SUFFIX: &str = ".html";
/// Same-second reports get `_2`, `_3`, ... up to this many names.
const MAX_NAME_ATTEMPTS: usize = 100;

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot handoff between a report job and whoever waits for it.
///
/// Exactly one side wins: the job commits before persisting, or the waiter
/// cancels. A cancelled job drops its temp file and never persists.
#[derive(Debug, Clone, Default)]
pub struct CommitGate {
    state: Arc<AtomicU8>,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to persist. False once the gate was cancelled.
    pub fn try_commit(&self) -> bool {
        self.transition(COMMITTED)
    }

    /// Claims the cancellation. False once the job has committed.
    pub fn try_cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Directory of rendered reports, addressed by exact file name.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Renders `report` and persists it atomically under a name no other
    /// report holds. Returns the file name.
    pub fn write(
        &self,
        report: &Report,
        generated_at: SystemTime,
        gate: &CommitGate,
    ) -> Result<String, ReportError> {
        fs::create_dir_all(&self.dir)?;
        let html = render_html(report, generated_at);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(html.as_bytes())?;
        tmp.as_file().sync_all()?;

        if !gate.try_commit() {
            debug!("report cancelled before persisting, discarding temp file");
            return Err(ReportError::Cancelled);
        }

        let base = report_filename(generated_at);
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let filename = numbered(&base, attempt);
            match tmp.persist_noclobber(self.dir.join(&filename)) {
                Ok(_) => {
                    info!(
                        filename = %filename,
                        data_points = report.data_points,
                        "report written"
                    );
                    return Ok(filename);
                }
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => tmp = err.file,
                Err(err) => return Err(ReportError::Render(err.error)),
            }
        }
        Err(ReportError::Render(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free report name left for {base}"),
        )))
    }

    /// Resolves a file name previously returned by [`ReportStore::write`].
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ReportError> {
        let not_found = || ReportError::NotFound(name.to_string());
        if !is_report_name(name) {
            return Err(not_found());
        }
        let path = self.dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(not_found())
        }
    }
}

/// `system_report_YYYYMMDD_HHMMSS.html` in UTC.
pub fn report_filename(at: SystemTime) -> String {
    let digits: String = format_rfc3339(at)
        .chars()
        .filter(char::is_ascii_digit)
        .take(14)
        .collect();
    let (date, time) = digits.split_at(digits.len().min(8));
    format!("{REPORT_PREFIX}{date}_{time}{REPORT_SUFFIX}")
}

fn numbered(base: &str, attempt: usize) -> String {
    if attempt <= 1 {
        return base.to_string();
    }
    let stem = base.strip_suffix(REPORT_SUFFIX).unwrap_or(base);
    format!("{stem}_{attempt}{REPORT_SUFFIX}")
}

/// Only names this store hands out: the fixed prefix and suffix around
/// digits and underscores.
fn is_report_name(name: &str) -> bool {
    name.strip_prefix(REPORT_PREFIX)
        .and_then(|rest| rest.strip_suffix(REPORT_SUFFIX))
        .is_some_and(|middle| {
            !middle.is_empty() && middle.chars().all(|c| c.is_ascii_digit() || c == '_')
        })
}

pub fn render_html(report: &Report, generated_at: SystemTime) -> String {
    let mut out = String::with_capacity(64 * 1024);
    out.push_str(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>System Performance Report</title>\n<style>\n\
         body{font-family:Helvetica,Arial,sans-serif;margin:2em auto;max-width:860px;color:#333}\n\
         h1{color:#667eea;text-align:center}\n\
         h2{color:#764ba2;border-bottom:1px solid #ddd;padding-bottom:4px}\n\
         table{border-collapse:collapse;margin:1em 0;width:100%}\n\
         th,td{border:1px solid #ccc;padding:6px 10px;text-align:center}\n\
         th{background:#667eea;color:#fff}\n\
         footer{margin-top:3em;font-size:0.85em;color:#888;text-align:center}\n\
         </style>\n</head>\n<body>\n<h1>System Performance Report</h1>\n",
    );

    out.push_str("<h2>Report information</h2>\n<table>\n");
    let rows = [
        ("Start time", report.started_at.clone()),
        ("End time", report.ended_at.clone()),
        ("Duration", format!("{} seconds", report.duration_secs)),
        ("Data points", report.data_points.to_string()),
    ];
    for (key, value) in rows {
        let _ = writeln!(
            out,
            "<tr><th>{}</th><td>{}</td></tr>",
            escape(key),
            escape(&value)
        );
    }
    out.push_str("</table>\n");

    for section in report.sections() {
        render_section(&mut out, section);
    }

    let _ = write!(
        out,
        "<footer>Generated {}</footer>\n</body>\n</html>\n",
        escape(&format_rfc3339(generated_at))
    );
    out
}

fn render_section(out: &mut String, section: &Section) {
    let _ = writeln!(out, "<h2>{}</h2>", escape(section.title));
    if section.metrics.iter().any(|m| m.charted) {
        render_chart(out, section);
    }

    out.push_str("<table>\n<tr><th>Metric</th><th>Min</th><th>Max</th><th>Average</th></tr>\n");
    for metric in &section.metrics {
        let _ = writeln!(
            out,
            "<tr><td>{}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td></tr>",
            escape(metric.label),
            metric.stats.min,
            metric.stats.max,
            metric.stats.avg
        );
    }
    out.push_str("</table>\n");
}

fn render_chart(out: &mut String, section: &Section) {
    let charted: Vec<_> = section.metrics.iter().filter(|m| m.charted).collect();
    let len = charted.iter().map(|m| m.series.len()).max().unwrap_or(0);
    let peak = charted
        .iter()
        .flat_map(|m| m.series.iter().flatten())
        .copied()
        .fold(0.0_f64, f64::max);
    let y_max = if peak > 0.0 { peak * 1.1 } else { 1.0 };

    let plot_w = CHART_WIDTH - 2.0 * CHART_PAD;
    let plot_h = CHART_HEIGHT - 2.0 * CHART_PAD;
    let x_step = if len > 1 { plot_w / (len - 1) as f64 } else { 0.0 };

    let _ = writeln!(
        out,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{CHART_WIDTH}\" height=\"{CHART_HEIGHT}\" \
         viewBox=\"0 0 {CHART_WIDTH} {CHART_HEIGHT}\" role=\"img\" aria-label=\"{}\">",
        escape(section.title)
    );
    let _ = writeln!(
        out,
        "<rect x=\"{CHART_PAD}\" y=\"{CHART_PAD}\" width=\"{plot_w}\" height=\"{plot_h}\" \
         fill=\"#fafafa\" stroke=\"#ccc\"/>"
    );
    let _ = writeln!(
        out,
        "<text x=\"{CHART_PAD}\" y=\"{:.1}\" font-size=\"11\">{:.2}</text>\
         <text x=\"{CHART_PAD}\" y=\"{:.1}\" font-size=\"11\">0</text>",
        CHART_PAD - 4.0,
        y_max,
        CHART_HEIGHT - CHART_PAD + 14.0
    );
    let _ = writeln!(
        out,
        "<text x=\"{:.1}\" y=\"{:.1}\" font-size=\"11\" text-anchor=\"end\">{} / sample</text>",
        CHART_WIDTH - CHART_PAD,
        CHART_HEIGHT - CHART_PAD + 14.0,
        escape(section.y_label)
    );

    for (idx, metric) in charted.iter().enumerate() {
        let color = PALETTE[idx % PALETTE.len()];
        for segment in segments(&metric.series) {
            let points: Vec<String> = segment
                .iter()
                .map(|(i, v)| {
                    let x = CHART_PAD + *i as f64 * x_step;
                    let y = CHART_HEIGHT - CHART_PAD - (v / y_max) * plot_h;
                    format!("{x:.1},{y:.1}")
                })
                .collect();
            let _ = writeln!(
                out,
                "<polyline fill=\"none\" stroke=\"{color}\" stroke-width=\"2\" points=\"{}\"/>",
                points.join(" ")
            );
        }
        let _ = writeln!(
            out,
            "<text x=\"{:.1}\" y=\"{:.1}\" font-size=\"12\" fill=\"{color}\">{}</text>",
            CHART_PAD + 160.0 * idx as f64,
            CHART_PAD - 18.0,
            escape(metric.label)
        );
    }
    out.push_str("</svg>\n");
}

/// Splits a series at unknown values so gaps are not bridged by a line.
fn segments(series: &[Option<f64>]) -> Vec<Vec<(usize, f64)>> {
    let mut all = Vec::new();
    let mut current = Vec::new();
    for (i, value) in series.iter().enumerate() {
        match value {
            Some(v) => current.push((i, *v)),
            None if !current.is_empty() => all.push(std::mem::take(&mut current)),
            None => {}
        }
    }
    if !current.is_empty() {
        all.push(current);
    }
    all
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{reduce, MIN_REPORT_SAMPLES};
    use crate::sample::Sample;
    use std::time::{Duration, UNIX_EPOCH};

    fn report(n: usize) -> Report {
        let samples: Vec<Arc<Sample>> = (0..n)
            .map(|i| {
                let mut s = Sample::empty(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i as u64));
                s.cpu.usage_percent = (i * 10) as f64;
                Arc::new(s)
            })
            .collect();
        reduce(&samples, MIN_REPORT_SAMPLES).unwrap()
    }

    #[test]
    fn filename_is_utc_timestamp() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(report_filename(at), "system_report_20231114_221320.html");
    }

    #[test]
    fn html_contains_tables_and_charts() {
        let html = render_html(&report(10), UNIX_EPOCH);
        assert!(html.contains("<h2>CPU</h2>"));
        assert!(html.contains("<polyline"));
        assert!(html.contains("<td>CPU usage (%)</td><td>0.00</td><td>90.00</td><td>45.00</td>"));
        assert!(html.contains("2023-11-14T22:13:20Z"));
        assert!(!html.contains("<h2>GPU</h2>"));
    }

    #[test]
    fn gaps_split_polylines() {
        let series = [Some(1.0), None, None, Some(2.0), Some(3.0)];
        let parts = segments(&series);
        assert_eq!(parts, vec![vec![(0, 1.0)], vec![(3, 2.0), (4, 3.0)]]);
    }

    #[test]
    fn labels_are_escaped() {
        assert_eq!(escape("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }

    #[test]
    fn write_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let store = ReportStore::new(&reports);
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let name = store.write(&report(12), at, &CommitGate::new()).unwrap();
        assert_eq!(name, "system_report_20231114_221320.html");

        let path = store.resolve(&name).unwrap();
        let body = fs::read_to_string(path).unwrap();
        assert!(body.starts_with("<!DOCTYPE html>"));

        let leftovers = fs::read_dir(&reports).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn traversal_and_missing_names_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        for name in [
            "",
            "../etc/passwd",
            "a/b.html",
            "a\\b.html",
            "..",
            "missing.html",
            "system_report_20231114_221320.html",
        ] {
            assert!(
                matches!(store.resolve(name), Err(ReportError::NotFound(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn only_report_names_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let in_flight = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let tmp_name = in_flight.path().file_name().unwrap().to_str().unwrap().to_string();
        fs::write(dir.path().join("notes.html"), "x").unwrap();
        fs::write(dir.path().join("system_report_x.html"), "x").unwrap();

        for name in [tmp_name.as_str(), "notes.html", "system_report_x.html"] {
            assert!(
                matches!(store.resolve(name), Err(ReportError::NotFound(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn same_second_reports_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let first = store.write(&report(10), at, &CommitGate::new()).unwrap();
        let second = store.write(&report(12), at, &CommitGate::new()).unwrap();
        let third = store.write(&report(14), at, &CommitGate::new()).unwrap();
        assert_eq!(first, "system_report_20231114_221320.html");
        assert_eq!(second, "system_report_20231114_221320_2.html");
        assert_eq!(third, "system_report_20231114_221320_3.html");

        let body = fs::read_to_string(store.resolve(&first).unwrap()).unwrap();
        assert!(body.contains("<th>Data points</th><td>10</td>"));
        let body = fs::read_to_string(store.resolve(&second).unwrap()).unwrap();
        assert!(body.contains("<th>Data points</th><td>12</td>"));
    }

    #[test]
    fn cancelled_gate_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let store = ReportStore::new(&reports);
        let gate = CommitGate::new();
        assert!(gate.try_cancel());

        let err = store.write(&report(10), UNIX_EPOCH, &gate).unwrap_err();
        assert!(matches!(err, ReportError::Cancelled));
        assert_eq!(fs::read_dir(&reports).unwrap().count(), 0);
    }

    #[test]
    fn gate_has_a_single_winner() {
        let gate = CommitGate::new();
        assert!(gate.try_commit());
        assert!(!gate.try_cancel());
        assert!(!gate.try_commit());

        let gate = CommitGate::new();
        assert!(gate.try_cancel());
        assert!(!gate.try_commit());
    }
}
