pub mod action;
pub mod agent;
pub mod bench;
pub mod desktop;
pub mod parser;
pub mod vlm;

pub use action::{Action, ParsedResponse, ResponseStatus};
pub use agent::{Agent, AgentConfig, AgentError, StopHandle, TaskResult, TerminationReason};
pub use bench::{Benchmark, BenchmarkReport, BenchmarkTask};
pub use desktop::{CommandScreen, DesktopConfig, XdotoolExecutor};
pub use vlm::{VlmClient, VlmConfig};
