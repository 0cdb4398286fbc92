mod artifact;
mod command;
mod retry;
mod spawner;
mod traits;

pub use artifact::Artifact;
pub use command::{CommandGenerator, CommandWorker};
pub use retry::{Retryable, RetryPolicy};
pub use spawner::{ProcessSpawner, SpawnedOutput};
pub use traits::{CallConfig, InstructionGenerator, ProxyError, TaskContext, WorkerProxy};
