use anyhow::{Context, Result};
use screen_pilot::desktop::{CommandScreen, DesktopConfig, XdotoolExecutor};
use screen_pilot::vlm::{VlmClient, VlmConfig};
use screen_pilot::bench::{to_markdown, BenchmarkReport};
use screen_pilot::{Agent, AgentConfig, Benchmark, StopHandle};
use tracing_subscriber::EnvFilter;

// Usage: bench <tasks.json> [task-id ...]
//        bench compare <report.json> ...
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let tasks_path = args.next().context("usage: bench <tasks.json> [task-id ...]")?;
    if tasks_path == "compare" {
        let mut reports = Vec::new();
        for path in args {
            reports.push(BenchmarkReport::from_file(&path).await?);
        }
        println!("{}", to_markdown(&reports));
        return Ok(());
    }
    let ids: Vec<String> = args.collect();

    let bench = Benchmark::from_file(&tasks_path).await?;
    let vlm = VlmClient::new(VlmConfig::from_env()?)?;
    let model = vlm.model().to_string();
    let provider = vlm.provider().to_string();

    let stop = StopHandle::new();
    let desktop = DesktopConfig::from_env()?;
    let executor = XdotoolExecutor::new(desktop.clone(), &model).with_stop_handle(stop.clone());
    let agent = Agent::new(CommandScreen::new(desktop), vlm, executor, AgentConfig::from_env()?)
        .with_stop_handle(stop.clone());

    // Ctrl-C stops the current task; the remaining ones still run.
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            stop.request_stop();
        }
    });

    let report = bench.run(&agent, &model, &provider, &ids).await?;
    let summary = report.summary();
    println!(
        "{model}: {}/{} completed, {:.0}% verified, {:.1} steps avg",
        report.scores.iter().filter(|s| s.completed).count(),
        summary.tasks,
        summary.verification_rate * 100.0,
        summary.avg_steps,
    );

    let out = std::env::temp_dir().join(format!("screen-pilot-bench-{}.json", report.timestamp_ms));
    tokio::fs::write(&out, report.to_json()?).await?;
    println!("report written to {}", out.display());
    Ok(())
}
