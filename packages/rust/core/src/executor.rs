//! Step executors.
//!
//! The orchestrator never performs step work itself. It calls a [`StepExecutor`]
//! with the entity's opaque metadata and records the [`StepOutcome`].
//! Production wiring uses a [`StepRouter`] of [`CommandExecutor`]s built from
//! config; steps without a configured command fall through to
//! [`PassThroughExecutor`].

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use pubflow_shared::{CommandSpec, PipelineError, Result, RunConfig, WorkflowStep};

/// Longest stderr excerpt kept in a failure message.
const MAX_ERROR_CHARS: usize = 2_000;

/// Result reported by an executor for one entity at one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { metrics: Option<serde_json::Value> },
    Failed { error_message: String },
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::Succeeded { metrics: None }
    }

    pub fn success_with(metrics: serde_json::Value) -> Self {
        Self::Succeeded {
            metrics: Some(metrics),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failed {
            error_message: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Performs the work of a step. Must tolerate being called again for the same
/// entity and step after an interrupted or failed attempt.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        entity_id: &str,
        metadata: &serde_json::Value,
        step: WorkflowStep,
    ) -> StepOutcome;
}

/// Succeeds immediately without doing anything.
pub struct PassThroughExecutor;

#[async_trait]
impl StepExecutor for PassThroughExecutor {
    async fn execute(
        &self,
        _entity_id: &str,
        _metadata: &serde_json::Value,
        _step: WorkflowStep,
    ) -> StepOutcome {
        StepOutcome::success()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Dispatches each step to its own executor.
pub struct StepRouter {
    routes: BTreeMap<WorkflowStep, Arc<dyn StepExecutor>>,
    fallback: Arc<dyn StepExecutor>,
}

impl StepRouter {
    /// A router where every step passes through.
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
            fallback: Arc::new(PassThroughExecutor),
        }
    }

    /// Route `step` to `executor`.
    pub fn route(mut self, step: WorkflowStep, executor: Arc<dyn StepExecutor>) -> Self {
        self.routes.insert(step, executor);
        self
    }

    /// One [`CommandExecutor`] per configured step.
    pub fn from_config(config: &RunConfig) -> Self {
        config
            .executors
            .iter()
            .fold(Self::new(), |router, (step, spec)| {
                router.route(*step, Arc::new(CommandExecutor::new(spec.clone())))
            })
    }

    /// Steps that have a dedicated executor.
    pub fn routed_steps(&self) -> Vec<WorkflowStep> {
        self.routes.keys().copied().collect()
    }
}

impl Default for StepRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for StepRouter {
    async fn execute(
        &self,
        entity_id: &str,
        metadata: &serde_json::Value,
        step: WorkflowStep,
    ) -> StepOutcome {
        let executor = self.routes.get(&step).unwrap_or(&self.fallback);
        executor.execute(entity_id, metadata, step).await
    }
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Runs an external command for a step.
///
/// Protocol: the entity metadata is written to stdin as JSON, and the entity id
/// and step name are exported as `PUBFLOW_ENTITY_ID` / `PUBFLOW_STEP`. Exit
/// status 0 means success, and a JSON object printed on stdout becomes the
/// step's metrics. Any other exit fails the step with the tail of stderr.
pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    async fn run(
        &self,
        entity_id: &str,
        metadata: &serde_json::Value,
        step: WorkflowStep,
    ) -> Result<StepOutcome> {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .env("PUBFLOW_ENTITY_ID", entity_id)
            .env("PUBFLOW_STEP", step.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::Executor(format!(
                "failed to spawn `{}`: {e}. Is it installed?",
                self.spec.command
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(metadata)?;
            // The command may exit without reading its input.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "executor did not consume stdin");
            }
        }

        let timeout = Duration::from_secs(self.spec.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                PipelineError::Executor(format!("failed to wait for `{}`: {e}", self.spec.command))
            })?,
            Err(_) => {
                return Ok(StepOutcome::failure(format!(
                    "`{}` timed out after {}s",
                    self.spec.command, self.spec.timeout_secs
                )));
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let metrics = serde_json::from_str::<serde_json::Value>(stdout.trim())
                .ok()
                .filter(serde_json::Value::is_object);
            return Ok(StepOutcome::Succeeded { metrics });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = tail(stderr.trim(), MAX_ERROR_CHARS);

        Ok(StepOutcome::failure(if detail.is_empty() {
            format!("`{}` exited with status {status}", self.spec.command)
        } else {
            detail
        }))
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    #[instrument(skip_all, fields(entity = %entity_id, step = %step, command = %self.spec.command))]
    async fn execute(
        &self,
        entity_id: &str,
        metadata: &serde_json::Value,
        step: WorkflowStep,
    ) -> StepOutcome {
        match self.run(entity_id, metadata, step).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "executor command could not run");
                StepOutcome::failure(e.to_string())
            }
        }
    }
}

/// Last `max` characters of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(StepOutcome);

    #[async_trait]
    impl StepExecutor for Fixed {
        async fn execute(&self, _: &str, _: &serde_json::Value, _: WorkflowStep) -> StepOutcome {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn router_uses_route_then_fallback() {
        let router = StepRouter::new().route(
            WorkflowStep::Tested,
            Arc::new(Fixed(StepOutcome::failure("type error"))),
        );
        let meta = serde_json::Value::Null;

        let tested = router.execute("p1", &meta, WorkflowStep::Tested).await;
        assert_eq!(tested, StepOutcome::failure("type error"));

        let published = router.execute("p1", &meta, WorkflowStep::Published).await;
        assert!(published.is_success());
        assert_eq!(router.routed_steps(), vec![WorkflowStep::Tested]);
    }

    #[test]
    fn router_from_config_routes_configured_steps() {
        let mut app = pubflow_shared::AppConfig::default();
        app.executors.insert(
            "validated".into(),
            CommandSpec {
                command: "true".into(),
                args: vec![],
                timeout_secs: 30,
                working_dir: None,
            },
        );
        let run = RunConfig::try_from(&app).expect("run config");
        let router = StepRouter::from_config(&run);
        assert_eq!(router.routed_steps(), vec![WorkflowStep::Validated]);
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout_secs: u64) -> CommandExecutor {
        CommandExecutor::new(CommandSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs,
            working_dir: None,
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_success_reports_metrics() {
        let exec = sh(r#"cat > /dev/null; echo '{"examples": 4}'"#, 10);
        let outcome = exec
            .execute("p1", &serde_json::json!({ "path": "p1.md" }), WorkflowStep::Tested)
            .await;
        assert_eq!(outcome, StepOutcome::success_with(serde_json::json!({ "examples": 4 })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_metadata_and_env() {
        let exec = sh(
            r#"test "$PUBFLOW_STEP" = validated && test "$PUBFLOW_ENTITY_ID" = p7 && grep -q '"slug":"intro"'"#,
            10,
        );
        let outcome = exec
            .execute("p7", &serde_json::json!({ "slug": "intro" }), WorkflowStep::Validated)
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_reports_stderr() {
        let exec = sh("echo 'type error' >&2; exit 2", 10);
        let outcome = exec
            .execute("p2", &serde_json::Value::Null, WorkflowStep::Tested)
            .await;
        assert_eq!(outcome, StepOutcome::failure("type error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_without_stderr_reports_status() {
        let exec = sh("exit 3", 10);
        let outcome = exec
            .execute("p2", &serde_json::Value::Null, WorkflowStep::Tested)
            .await;
        assert_eq!(outcome, StepOutcome::failure("`sh` exited with status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout_fails_step() {
        let exec = sh("sleep 5", 1);
        let outcome = exec
            .execute("p3", &serde_json::Value::Null, WorkflowStep::Published)
            .await;
        match outcome {
            StepOutcome::Failed { error_message } => assert!(error_message.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_step() {
        let exec = CommandExecutor::new(CommandSpec {
            command: "pubflow-definitely-not-a-real-binary".into(),
            args: vec![],
            timeout_secs: 5,
            working_dir: None,
        });
        let outcome = exec
            .execute("p4", &serde_json::Value::Null, WorkflowStep::Ingested)
            .await;
        match outcome {
            StepOutcome::Failed { error_message } => {
                assert!(error_message.contains("failed to spawn"))
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}
