//! In-memory build executor for testing.
//!
//! Every submission succeeds after a configurable number of `Running` polls
//! unless an outcome was scripted for its `(application, version)`. Scripted
//! outcomes are consumed one per submission, so a failure followed by a
//! success models a retry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{BuildExecutor, BuildTask, ExecutionHandle, ExecutionStatus};
use crate::error::{Error, Result};

/// What the next submission for an identity does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Completes successfully.
    Succeed,
    /// Completes with a failure reason.
    Fail(String),
    /// Never leaves `Running`.
    Hang,
    /// Submission itself is rejected.
    RejectSubmission(String),
    /// Execution disappears; status reads fail.
    Lose,
}

#[derive(Debug)]
struct Execution {
    outcome: ScriptedOutcome,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct ExecutorState {
    scripts: HashMap<(String, String), VecDeque<ScriptedOutcome>>,
    executions: HashMap<String, Execution>,
    submissions: Vec<BuildTask>,
    active: HashSet<String>,
    max_active: usize,
    next_id: u64,
}

/// Scriptable [`BuildExecutor`].
#[derive(Debug, Default)]
pub struct InMemoryBuildExecutor {
    state: RwLock<ExecutorState>,
    polls_before_completion: u32,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::executor("in-memory executor lock poisoned")
}

impl InMemoryBuildExecutor {
    /// Creates an executor whose builds finish on the first status poll.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `Running` this many times before each terminal status.
    #[must_use]
    pub fn with_polls_before_completion(mut self, polls: u32) -> Self {
        self.polls_before_completion = polls;
        self
    }

    /// Queues `outcome` for the next submission of `application`/`version`.
    pub fn script(&self, application: &str, version: &str, outcome: ScriptedOutcome) {
        if let Ok(mut state) = self.state.write() {
            state
                .scripts
                .entry((application.to_string(), version.to_string()))
                .or_default()
                .push_back(outcome);
        }
    }

    /// Returns accepted submissions in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<BuildTask> {
        self.state
            .read()
            .map_or_else(|_| Vec::new(), |state| state.submissions.clone())
    }

    /// Returns how many submissions were accepted for `application`/`version`.
    #[must_use]
    pub fn submission_count(&self, application: &str, version: &str) -> usize {
        self.state.read().map_or(0, |state| {
            state
                .submissions
                .iter()
                .filter(|task| {
                    task.identity.application_name() == application
                        && task.identity.version() == version
                })
                .count()
        })
    }

    /// Returns the highest number of executions running at the same time.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.state.read().map_or(0, |state| state.max_active)
    }
}

#[async_trait]
impl BuildExecutor for InMemoryBuildExecutor {
    async fn submit(&self, task: &BuildTask) -> Result<ExecutionHandle> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = (
            task.identity.application_name().to_string(),
            task.identity.version().to_string(),
        );
        let outcome = state
            .scripts
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Succeed);
        if let ScriptedOutcome::RejectSubmission(message) = outcome {
            return Err(Error::executor(message));
        }

        state.next_id += 1;
        let id = format!("mem-build-{}", state.next_id);
        state.executions.insert(
            id.clone(),
            Execution {
                outcome,
                polls_left: self.polls_before_completion,
            },
        );
        state.submissions.push(task.clone());
        state.active.insert(id.clone());
        state.max_active = state.max_active.max(state.active.len());
        drop(state);
        Ok(ExecutionHandle(id))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let mut guard = self.state.write().map_err(poison_err)?;
        let state = &mut *guard;
        let execution = state
            .executions
            .get_mut(&handle.0)
            .ok_or_else(|| Error::executor(format!("unknown execution {handle}")))?;

        let status = match &execution.outcome {
            ScriptedOutcome::Hang => ExecutionStatus::Running,
            _ if execution.polls_left > 0 => {
                execution.polls_left -= 1;
                ExecutionStatus::Running
            }
            ScriptedOutcome::Succeed => ExecutionStatus::Succeeded,
            ScriptedOutcome::Fail(reason) => ExecutionStatus::Failed {
                reason: reason.clone(),
            },
            ScriptedOutcome::Lose | ScriptedOutcome::RejectSubmission(_) => {
                state.active.remove(&handle.0);
                return Err(Error::executor(format!("execution {handle} not found")));
            }
        };
        if status != ExecutionStatus::Running {
            state.active.remove(&handle.0);
        }
        drop(guard);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::identify;

    fn task(path: &str) -> BuildTask {
        let identity = identify(path).expect("valid");
        BuildTask::new(&identity, "gcr.io/acme", path.to_string())
    }

    #[tokio::test]
    async fn scripts_are_consumed_per_submission() {
        let executor = InMemoryBuildExecutor::new();
        executor.script("widgets", "v1.0", ScriptedOutcome::Fail("boom".into()));

        let first = executor.submit(&task("widgets/v1.0.tar")).await.expect("submit");
        let second = executor.submit(&task("widgets/v1.0.tar")).await.expect("submit");

        assert_eq!(
            executor.status(&first).await.expect("status"),
            ExecutionStatus::Failed {
                reason: "boom".into()
            }
        );
        assert_eq!(
            executor.status(&second).await.expect("status"),
            ExecutionStatus::Succeeded
        );
        assert_eq!(executor.submission_count("widgets", "v1.0"), 2);
    }

    #[tokio::test]
    async fn running_polls_precede_completion() {
        let executor = InMemoryBuildExecutor::new().with_polls_before_completion(1);
        let handle = executor.submit(&task("widgets/v1.0.tar")).await.expect("submit");
        assert_eq!(executor.status(&handle).await.expect("status"), ExecutionStatus::Running);
        assert_eq!(executor.status(&handle).await.expect("status"), ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn lost_execution_is_an_executor_error() {
        let executor = InMemoryBuildExecutor::new();
        executor.script("widgets", "v1.0", ScriptedOutcome::Lose);
        let handle = executor.submit(&task("widgets/v1.0.tar")).await.expect("submit");
        assert!(matches!(
            executor.status(&handle).await,
            Err(Error::Executor { .. })
        ));
    }

    #[tokio::test]
    async fn tracks_concurrent_executions() {
        let executor = InMemoryBuildExecutor::new();
        let a = executor.submit(&task("widgets/v1.0.tar")).await.expect("submit");
        let b = executor.submit(&task("gadgets/v1.0.tar")).await.expect("submit");
        executor.status(&a).await.expect("status");
        executor.status(&b).await.expect("status");
        let _c = executor.submit(&task("gizmos/v1.0.tar")).await.expect("submit");
        assert_eq!(executor.max_concurrent(), 2);
    }
}
