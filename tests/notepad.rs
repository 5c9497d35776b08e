use async_trait::async_trait;
use screen_pilot::action::Action;
use screen_pilot::agent::{
    ActionOutcome, Executor, Reasoner, StaticScreen, Step, ThinkRequest,
};
use screen_pilot::{Agent, AgentConfig, AgentError, TerminationReason};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Script(Mutex<VecDeque<&'static str>>);

#[async_trait]
impl Reasoner for Script {
    async fn ask(&self, _request: &ThinkRequest<'_>) -> Result<String, AgentError> {
        let next = self.0.lock().unwrap().pop_front();
        next.map(str::to_string)
            .ok_or_else(|| AgentError::Transport("script exhausted".into()))
    }
}

#[derive(Clone, Default)]
struct Host(Arc<Mutex<Vec<Action>>>);

#[async_trait]
impl Executor for Host {
    async fn execute(&self, action: &Action) -> ActionOutcome {
        self.0.lock().unwrap().push(action.clone());
        ActionOutcome::ok(format!("did {action}"))
    }
}

#[tokio::test]
async fn opens_notepad_through_the_run_dialog() {
    let replies = VecDeque::from([
        "Thought: open the run dialog\nAction: hotkey(win, r)",
        "Thought: type the program name\nAction: type_text(\"notepad\")",
        "**Thought:** launch it\n**Action:** key_press(enter)",
        r#"{"thought": "Notepad is open", "action": {"type": "done", "params": {"message": "Notepad opened"}}, "status": "completed"}"#,
    ]);
    let host = Host::default();
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    let seen_cb = seen.clone();

    let agent = Agent::new(
        StaticScreen::new("image/png", "iVBORw0KGgo="),
        Script(Mutex::new(replies)),
        host.clone(),
        AgentConfig { max_steps: 10, step_delay: Duration::ZERO, ..AgentConfig::default() },
    )
    .with_step_callback(move |step: &Step| seen_cb.lock().unwrap().push(step.index));

    let result = agent.run("Open Notepad").await.unwrap();

    assert!(result.success);
    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.steps_executed, 4);
    assert_eq!(result.final_message, "Notepad opened");
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);

    let performed = host.0.lock().unwrap().clone();
    assert_eq!(
        performed,
        vec![
            Action::Hotkey { keys: vec!["win".into(), "r".into()] },
            Action::TypeText { text: "notepad".into() },
            Action::KeyPress { key: "enter".into() },
        ]
    );
    assert!(result.steps.iter().all(|s| s.success));
}
