use anyhow::Result;
use screen_pilot::desktop::{CommandScreen, DesktopConfig, XdotoolExecutor};
use screen_pilot::vlm::{VlmClient, VlmConfig};
use screen_pilot::{Agent, AgentConfig, StopHandle};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let task = if task.trim().is_empty() { "Open Notepad".to_string() } else { task };

    let vlm = VlmClient::new(VlmConfig::from_env()?)?;
    if !vlm.test_connection().await {
        anyhow::bail!("cannot reach the {} backend", vlm.provider());
    }

    let stop = StopHandle::new();
    let desktop = DesktopConfig::from_env()?;
    let executor = XdotoolExecutor::new(desktop.clone(), vlm.model()).with_stop_handle(stop.clone());
    let agent = Agent::new(CommandScreen::new(desktop), vlm, executor, AgentConfig::from_env()?)
        .with_stop_handle(stop.clone())
        .with_step_callback(|step| {
            println!("[{}] {} -> {} ({})", step.index, step.thought, step.action, step.result);
        });

    // Ctrl-C asks the loop to stop at the next safe point.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.request_stop();
        }
    });

    let result = agent.run(&task).await?;
    println!("{}", serde_json::to_string_pretty(&result.termination_reason)?);
    println!("{} after {} step(s)", result.final_message, result.steps_executed);
    Ok(())
}
