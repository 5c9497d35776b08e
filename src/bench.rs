use crate::agent::{Agent, AgentError, Executor, Reasoner, Screen, TaskResult, TerminationReason};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{info, warn};

fn default_max_steps() -> usize {
    10
}

/// One benchmark task as stored in the task file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkTask {
    pub id: String,
    pub description: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub verify: Option<Verification>,
}

/// Post-run check of the host state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verification {
    ProcessRunning { process: String },
    ProcessRunningAny { processes: Vec<String> },
    #[serde(alias = "window_contains_text")]
    WindowExists { window_title: String },
}

impl Verification {
    pub async fn check(&self) -> bool {
        match self {
            Verification::ProcessRunning { process } => process_running(process).await,
            Verification::ProcessRunningAny { processes } => {
                for p in processes {
                    if process_running(p).await {
                        return true;
                    }
                }
                false
            }
            Verification::WindowExists { window_title } => window_exists(window_title).await,
        }
    }
}

async fn process_running(name: &str) -> bool {
    // Windows-style names like "notepad.exe" match the bare process name here.
    let name = name.strip_suffix(".exe").unwrap_or(name);
    match Command::new("pgrep").args(["-x", "-i", name]).output().await {
        Ok(out) => out.status.success(),
        Err(e) => {
            warn!(error = %e, "pgrep unavailable");
            false
        }
    }
}

async fn window_exists(title: &str) -> bool {
    if title.trim().is_empty() {
        return false;
    }
    let pattern = regex::escape(title);
    match Command::new("xdotool").args(["search", "--name", &pattern]).output().await {
        Ok(out) => out.status.success() && !out.stdout.is_empty(),
        Err(e) => {
            warn!(error = %e, "xdotool unavailable");
            false
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskScore {
    pub task_id: String,
    pub description: String,
    pub completed: bool,
    pub verified: bool,
    pub steps_used: usize,
    pub max_steps: usize,
    pub termination_reason: TerminationReason,
    pub response_time_s: f64,
    /// Share of steps whose reply could be parsed.
    pub parse_success_rate: f64,
}

impl TaskScore {
    pub fn from_result(task: &BenchmarkTask, result: &TaskResult, verified: bool) -> Self {
        let parsed = result
            .steps
            .iter()
            .filter(|s| !matches!(s.error, Some(AgentError::Parse(_))))
            .count();
        let parse_success_rate = if result.steps.is_empty() {
            0.0
        } else {
            parsed as f64 / result.steps.len() as f64
        };
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            completed: result.success,
            verified,
            steps_used: result.steps_executed,
            max_steps: task.max_steps,
            termination_reason: result.termination_reason,
            response_time_s: result.time_ms as f64 / 1000.0,
            parse_success_rate,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkSummary {
    pub tasks: usize,
    pub completion_rate: f64,
    pub verification_rate: f64,
    pub avg_steps: f64,
    pub avg_response_time_s: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub model_name: String,
    pub provider: String,
    pub timestamp_ms: u128,
    pub scores: Vec<TaskScore>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

impl BenchmarkReport {
    pub fn new(model_name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            provider: provider.into(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
            scores: Vec::new(),
        }
    }

    pub fn completion_rate(&self) -> f64 {
        mean(self.scores.iter().map(|s| if s.completed { 1.0 } else { 0.0 }))
    }

    pub fn verification_rate(&self) -> f64 {
        mean(self.scores.iter().map(|s| if s.verified { 1.0 } else { 0.0 }))
    }

    /// Averaged over completed tasks only.
    pub fn avg_steps(&self) -> f64 {
        mean(self.scores.iter().filter(|s| s.completed).map(|s| s.steps_used as f64))
    }

    pub fn avg_response_time(&self) -> f64 {
        mean(self.scores.iter().map(|s| s.response_time_s))
    }

    pub fn summary(&self) -> BenchmarkSummary {
        BenchmarkSummary {
            tasks: self.scores.len(),
            completion_rate: self.completion_rate(),
            verification_rate: self.verification_rate(),
            avg_steps: self.avg_steps(),
            avg_response_time_s: self.avg_response_time(),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse report {}", path.display()))
    }

    pub fn score(&self, task_id: &str) -> Option<&TaskScore> {
        self.scores.iter().find(|s| s.task_id == task_id)
    }

    /// Report plus summary, pretty-printed.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut v = serde_json::to_value(self)?;
        v["summary"] = serde_json::to_value(self.summary())?;
        serde_json::to_string_pretty(&v)
    }
}

/// Task ids across `reports`, in first-seen order.
fn task_ids(reports: &[BenchmarkReport]) -> Vec<&str> {
    let mut ids: Vec<&str> = Vec::new();
    for id in reports.iter().flat_map(|r| r.scores.iter().map(|s| s.task_id.as_str())) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn summary_rows(reports: &[BenchmarkReport]) -> Vec<(&'static str, Vec<String>)> {
    let summaries: Vec<BenchmarkSummary> = reports.iter().map(BenchmarkReport::summary).collect();
    let row = |f: &dyn Fn(&BenchmarkSummary) -> String| summaries.iter().map(f).collect::<Vec<_>>();
    vec![
        ("Task Completion Rate", row(&|s| format!("{:.1}%", s.completion_rate * 100.0))),
        ("Verification Rate", row(&|s| format!("{:.1}%", s.verification_rate * 100.0))),
        ("Avg Steps", row(&|s| format!("{:.1}", s.avg_steps))),
        ("Avg Response Time", row(&|s| format!("{:.1}s", s.avg_response_time_s))),
    ]
}

fn mark(score: &TaskScore) -> &'static str {
    if score.completed {
        "pass"
    } else {
        "fail"
    }
}

/// Fixed-width side-by-side table for a terminal.
pub fn comparison_table(reports: &[BenchmarkReport]) -> String {
    if reports.is_empty() {
        return "No reports to compare.\n".to_string();
    }
    let mut out = String::new();
    let header = format!(
        "{:<30}{}",
        "Metric",
        reports.iter().map(|r| format!("{:>22}", r.model_name)).collect::<String>()
    );
    let rule = "-".repeat(header.chars().count());
    out.push_str(&header);
    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    for (name, cells) in summary_rows(reports) {
        out.push_str(&format!("{name:<30}"));
        for c in cells {
            out.push_str(&format!("{c:>22}"));
        }
        out.push('\n');
    }
    out.push_str(&rule);
    out.push('\n');
    for id in task_ids(reports) {
        out.push_str(&format!("{id:<30}"));
        for r in reports {
            let cell = match r.score(id) {
                Some(s) => format!("{} {} steps {:.0}s", mark(s), s.steps_used, s.response_time_s),
                None => "-".to_string(),
            };
            out.push_str(&format!("{cell:>22}"));
        }
        out.push('\n');
    }
    out
}

/// Markdown report with a summary table and a per-task table.
pub fn to_markdown(reports: &[BenchmarkReport]) -> String {
    let models = reports.iter().map(|r| r.model_name.as_str()).collect::<Vec<_>>().join(" | ");
    let sep = format!("|---|{}", "---|".repeat(reports.len()));
    let mut lines = vec![
        "# GUI Agent Benchmark Report".to_string(),
        String::new(),
        "## Summary".to_string(),
        String::new(),
        format!("| Metric | {models} |"),
        sep.clone(),
    ];
    for (name, cells) in summary_rows(reports) {
        lines.push(format!("| {name} | {} |", cells.join(" | ")));
    }
    lines.extend([
        String::new(),
        "## Per-Task Results".to_string(),
        String::new(),
        format!("| Task | {models} |"),
        sep,
    ]);
    for id in task_ids(reports) {
        let cells: Vec<String> = reports
            .iter()
            .map(|r| match r.score(id) {
                Some(s) => format!("{} {}/{}", mark(s), s.steps_used, s.max_steps),
                None => "-".to_string(),
            })
            .collect();
        lines.push(format!("| {id} | {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

pub struct Benchmark {
    tasks: Vec<BenchmarkTask>,
    settle: Duration,
}

impl Benchmark {
    pub fn new(tasks: Vec<BenchmarkTask>) -> Self {
        Self { tasks, settle: Duration::from_secs(1) }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let tasks: Vec<BenchmarkTask> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse tasks in {}", path.display()))?;
        Ok(Self::new(tasks))
    }

    /// Time given to the host to settle before verification.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn tasks(&self) -> &[BenchmarkTask] {
        &self.tasks
    }

    pub fn select(&self, ids: &[String]) -> Vec<&BenchmarkTask> {
        self.tasks
            .iter()
            .filter(|t| ids.is_empty() || ids.contains(&t.id))
            .collect()
    }

    pub async fn run_task<S, R, E>(
        &self,
        agent: &Agent<S, R, E>,
        task: &BenchmarkTask,
    ) -> Result<TaskScore, AgentError>
    where
        S: Screen,
        R: Reasoner,
        E: Executor,
    {
        info!(task = %task.id, max_steps = task.max_steps, "benchmark task");
        let result = agent.run_with_limit(&task.description, task.max_steps).await?;
        let verified = match (&task.verify, result.success) {
            (Some(check), true) => {
                tokio::time::sleep(self.settle).await;
                check.check().await
            }
            _ => false,
        };
        let score = TaskScore::from_result(task, &result, verified);
        info!(
            task = %task.id,
            completed = score.completed,
            verified = score.verified,
            steps = score.steps_used,
            "benchmark task scored"
        );
        Ok(score)
    }

    pub async fn run<S, R, E>(
        &self,
        agent: &Agent<S, R, E>,
        model_name: &str,
        provider: &str,
        ids: &[String],
    ) -> Result<BenchmarkReport, AgentError>
    where
        S: Screen,
        R: Reasoner,
        E: Executor,
    {
        let mut report = BenchmarkReport::new(model_name, provider);
        for task in self.select(ids) {
            report.scores.push(self.run_task(agent, task).await?);
        }
        Ok(report)
    }

    /// Runs the same tasks once per `(agent, model, provider)` entry.
    pub async fn compare<S, R, E>(
        &self,
        runs: &[(&Agent<S, R, E>, &str, &str)],
        ids: &[String],
    ) -> Result<Vec<BenchmarkReport>, AgentError>
    where
        S: Screen,
        R: Reasoner,
        E: Executor,
    {
        let mut reports = Vec::with_capacity(runs.len());
        for (agent, model, provider) in runs {
            info!(model = %model, provider = %provider, "benchmarking model");
            reports.push(self.run(agent, model, provider, ids).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, DryRunExecutor, StaticScreen, ThinkRequest};
    use async_trait::async_trait;

    struct Always(&'static str);

    #[async_trait]
    impl Reasoner for Always {
        async fn ask(&self, _request: &ThinkRequest<'_>) -> Result<String, AgentError> {
            Ok(self.0.to_string())
        }
    }

    fn score(id: &str, completed: bool, verified: bool, steps: usize, secs: f64) -> TaskScore {
        TaskScore {
            task_id: id.into(),
            description: String::new(),
            completed,
            verified,
            steps_used: steps,
            max_steps: 10,
            termination_reason: if completed { TerminationReason::Completed } else { TerminationReason::StepLimit },
            response_time_s: secs,
            parse_success_rate: 1.0,
        }
    }

    #[test]
    fn tasks_file_format() {
        let raw = r#"[
            {"id": "notepad", "description": "Open Notepad", "verify": {"type": "process_running", "process": "notepad.exe"}},
            {"id": "calc", "description": "Open the calculator", "max_steps": 5,
             "verify": {"type": "process_running_any", "processes": ["calc.exe", "gnome-calculator"]}},
            {"id": "free", "description": "Look around"}
        ]"#;
        let tasks: Vec<BenchmarkTask> = serde_json::from_str(raw).unwrap();
        assert_eq!(tasks[0].max_steps, 10);
        assert_eq!(tasks[0].verify, Some(Verification::ProcessRunning { process: "notepad.exe".into() }));
        assert_eq!(tasks[1].max_steps, 5);
        assert!(matches!(tasks[1].verify, Some(Verification::ProcessRunningAny { ref processes }) if processes.len() == 2));
        assert_eq!(tasks[2].verify, None);

        let bench = Benchmark::new(tasks);
        assert_eq!(bench.select(&[]).len(), 3);
        assert_eq!(bench.select(&["calc".to_string()])[0].id, "calc");
    }

    #[test]
    fn window_checks_in_tasks_file() {
        let raw = r#"[
            {"id": "w", "description": "d", "verify": {"type": "window_exists", "window_title": "Untitled - Notepad"}},
            {"id": "t", "description": "d", "verify": {"type": "window_contains_text", "window_title": "Notepad"}}
        ]"#;
        let tasks: Vec<BenchmarkTask> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            tasks[0].verify,
            Some(Verification::WindowExists { window_title: "Untitled - Notepad".into() })
        );
        assert_eq!(tasks[1].verify, Some(Verification::WindowExists { window_title: "Notepad".into() }));
    }

    #[tokio::test]
    async fn empty_window_title_never_verifies() {
        assert!(!Verification::WindowExists { window_title: "  ".into() }.check().await);
    }

    fn two_reports() -> Vec<BenchmarkReport> {
        let mut a = BenchmarkReport::new("qwen3-vl:8b", "ollama");
        a.scores = vec![score("notepad", true, true, 4, 12.0), score("calc", false, false, 10, 30.0)];
        let mut b = BenchmarkReport::new("qwen3-vl-flash", "openai_compat");
        b.scores = vec![score("calc", true, true, 3, 8.0), score("paint", true, false, 5, 9.0)];
        vec![a, b]
    }

    #[test]
    fn markdown_comparison() {
        let md = to_markdown(&two_reports());
        assert!(md.starts_with("# GUI Agent Benchmark Report"));
        assert!(md.contains("| Metric | qwen3-vl:8b | qwen3-vl-flash |"));
        assert!(md.contains("|---|---|---|"));
        assert!(md.contains("| Task Completion Rate | 50.0% | 100.0% |"));
        assert!(md.contains("| Avg Steps | 4.0 | 4.0 |"));
        assert!(md.contains("| notepad | pass 4/10 | - |"));
        assert!(md.contains("| calc | fail 10/10 | pass 3/10 |"));
        assert!(md.contains("| paint | - | pass 5/10 |"));
        let order: Vec<usize> = ["| notepad", "| calc", "| paint"].iter().map(|t| md.find(t).unwrap()).collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn terminal_comparison() {
        let table = comparison_table(&two_reports());
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("Metric"));
        assert!(lines[0].contains("qwen3-vl-flash"));
        assert!(table.contains("fail 10 steps 30s"));
        assert_eq!(comparison_table(&[]), "No reports to compare.\n");
    }

    #[tokio::test]
    async fn saved_report_loads_back() {
        let report = two_reports().remove(0);
        let path = std::env::temp_dir().join(format!("screen-pilot-report-{}.json", std::process::id()));
        tokio::fs::write(&path, report.to_json().unwrap()).await.unwrap();
        let loaded = BenchmarkReport::from_file(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(loaded.model_name, "qwen3-vl:8b");
        assert_eq!(loaded.scores, report.scores);
    }

    #[test]
    fn report_metrics() {
        let mut report = BenchmarkReport::new("qwen3-vl:8b", "ollama");
        assert_eq!(report.completion_rate(), 0.0);
        assert_eq!(report.avg_steps(), 0.0);

        report.scores = vec![
            score("a", true, true, 4, 10.0),
            score("b", true, false, 6, 20.0),
            score("c", false, false, 10, 30.0),
            score("d", false, false, 10, 40.0),
        ];
        assert_eq!(report.completion_rate(), 0.5);
        assert_eq!(report.verification_rate(), 0.25);
        assert_eq!(report.avg_steps(), 5.0);
        assert_eq!(report.avg_response_time(), 25.0);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["summary"]["tasks"], 4);
        assert_eq!(json["scores"][2]["termination_reason"], "step_limit");
    }

    #[tokio::test]
    async fn scores_a_run_with_the_task_step_limit() {
        let agent = Agent::new(
            StaticScreen::new("image/png", "AAAA"),
            Always("Thought: looking\nAction: move(1, 1)"),
            DryRunExecutor,
            AgentConfig { step_delay: Duration::ZERO, ..AgentConfig::default() },
        );
        let task = BenchmarkTask {
            id: "t".into(),
            description: "never finishes".into(),
            max_steps: 3,
            verify: Some(Verification::ProcessRunning { process: "no-such-process".into() }),
        };
        let bench = Benchmark::new(vec![task.clone()]).with_settle(Duration::ZERO);
        let score = bench.run_task(&agent, &task).await.unwrap();
        assert!(!score.completed);
        assert!(!score.verified);
        assert_eq!(score.steps_used, 3);
        assert_eq!(score.termination_reason, TerminationReason::StepLimit);
        assert_eq!(score.parse_success_rate, 1.0);
    }

    #[tokio::test]
    async fn compares_several_agents() {
        let cfg = AgentConfig { step_delay: Duration::ZERO, ..AgentConfig::default() };
        let quick = Agent::new(StaticScreen::new("image/png", "AAAA"), Always("Action: done"), DryRunExecutor, cfg.clone());
        let stuck = Agent::new(StaticScreen::new("image/png", "AAAA"), Always("Action: wait(0)"), DryRunExecutor, cfg);
        let task = BenchmarkTask { id: "t".into(), description: "x".into(), max_steps: 2, verify: None };
        let bench = Benchmark::new(vec![task]);
        let reports = bench
            .compare(&[(&quick, "quick", "p"), (&stuck, "stuck", "p")], &[])
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].model_name, "quick");
        assert_eq!(reports[0].completion_rate(), 1.0);
        assert_eq!(reports[1].completion_rate(), 0.0);
        assert_eq!(reports[1].scores[0].steps_used, 2);
    }

    #[tokio::test]
    async fn unparsable_replies_lower_the_parse_rate() {
        let agent = Agent::new(
            StaticScreen::new("image/png", "AAAA"),
            Always("I am not sure what to do"),
            DryRunExecutor,
            AgentConfig { step_delay: Duration::ZERO, max_consecutive_parse_failures: 1, ..AgentConfig::default() },
        );
        let task = BenchmarkTask { id: "t".into(), description: "x".into(), max_steps: 5, verify: None };
        let report = Benchmark::new(vec![task]).run(&agent, "m", "p", &[]).await.unwrap();
        assert_eq!(report.scores[0].parse_success_rate, 0.0);
        assert_eq!(report.scores[0].termination_reason, TerminationReason::Failed);
    }
}
