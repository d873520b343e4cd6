//! Host-side execution engine.
//!
//! The `ExecutionEngine` turns an [`ExecutionRequest`] into an
//! [`ExecutionResult`]. Every request gets its own worker process running a
//! fresh realm, so nothing a program does can outlive its request or reach
//! another request's state.
//!
//! # Lifecycle of a request
//!
//! 1. **Validation**: empty or oversized programs are refused up front
//! 2. **Admission**: a worker slot is taken from a semaphore, waiting or
//!    refusing per the configured [`AdmissionPolicy`]
//! 3. **Compile**: a worker is spawned and sent the program; it must report
//!    `compiled` within the compile budget
//! 4. **Execute**: the deadline starts; the worker must report `finished`
//!    before it runs out or it is killed
//! 5. **Serialize**: output and outcome become the external result
//!
//! # Example
//!
//! ```no_run
//! use scriptbox::config::EngineConfig;
//! use scriptbox::sandbox::engine::{ExecutionEngine, ExecutionRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = ExecutionEngine::new(EngineConfig::default())?;
//!
//! let result = engine
//!     .execute(ExecutionRequest::new("console.log('hi'); 40 + 2"))
//!     .await?;
//!
//! assert_eq!(result.output, "hi\nReturn value: 42");
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::{AdmissionPolicy, EngineConfig};
use crate::error::RequestError;
use crate::result::{serialize, ExecutionResult};
use crate::sandbox::collector::CollectedOutput;
use crate::sandbox::outcome::ExecutionOutcome;
use crate::sandbox::worker::{WorkerMessage, WorkerRequest};
use crate::utils::text::{describe_deadline, source_preview};

/// How long a worker gets to exit on its own after reporting.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// Slack on top of the output cap for protocol framing and JSON escaping.
const PROTOCOL_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Characters of source shown in log lines.
const LOG_PREVIEW_BYTES: usize = 80;

/// Error reported when the program kills its worker while being parsed.
pub const COMPILE_CRASH_MESSAGE: &str =
    "SyntaxError: program could not be parsed within the worker's stack or memory limit";

/// Error reported when the program kills its worker while running.
pub const RUNTIME_CRASH_MESSAGE: &str =
    "RangeError: program exceeded the worker's stack or memory limit";

/// A single program to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Program text.
    pub source: String,
    /// Requested deadline. `None` uses the configured default; anything
    /// above the configured maximum is clamped.
    pub deadline: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Checks the program text against the size cap.
    ///
    /// # Errors
    ///
    /// `EmptySource` for empty text, `SourceTooLarge` above `max_source_bytes`.
    pub fn validate(&self, max_source_bytes: usize) -> std::result::Result<(), RequestError> {
        if self.source.is_empty() {
            return Err(RequestError::EmptySource);
        }
        if self.source.len() > max_source_bytes {
            return Err(RequestError::SourceTooLarge {
                limit: max_source_bytes,
                actual: self.source.len(),
            });
        }
        Ok(())
    }
}

/// Protocol phase a worker was in when it stopped reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Execution,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile"),
            Phase::Execution => write!(f, "execution"),
        }
    }
}

/// Result of driving a worker through the protocol.
enum WorkerRun {
    Finished(CollectedOutput, ExecutionOutcome),
    /// The phase's time budget ran out.
    Overran(Phase),
    /// Stdout closed without a `finished` message.
    Exited(Phase),
    /// The worker was killed by a signal (abort on stack overflow or a
    /// failed allocation under its rlimit) while in this phase.
    Crashed(Phase),
}

/// Runs requests in isolated worker processes.
///
/// Cheap to clone; clones share the same worker slots.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    config: Arc<EngineConfig>,
    program: Arc<PathBuf>,
    permits: Arc<Semaphore>,
}

impl ExecutionEngine {
    /// Creates an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the worker
    /// executable cannot be located.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let program = config.workers.resolve_program()?;

        tracing::info!(
            "Execution engine ready: {} worker slot(s), {:?} admission, worker {}",
            config.workers.max_concurrent,
            config.workers.admission,
            program.display()
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.workers.max_concurrent)),
            program: Arc::new(program),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Worker executable in use.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Worker slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Validates, admits, runs and serializes one request.
    ///
    /// # Errors
    ///
    /// Only for requests that were never run: see [`RequestError`]. Every
    /// program that reaches a worker produces an `ExecutionResult`, whether
    /// it succeeded, threw, timed out or crashed its worker.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> std::result::Result<ExecutionResult, RequestError> {
        request.validate(self.config.limits.max_source_bytes)?;
        let deadline = self.config.limits.resolve_deadline(request.deadline);

        let _permit = self.admit().await?;
        let (output, outcome) = self.run(&request.source, deadline).await;

        Ok(serialize(&output, &outcome))
    }

    /// Runs a program in a fresh worker without admission control.
    ///
    /// Never fails: host-side problems become an `InternalFailure` outcome
    /// and are logged here in full.
    pub async fn run(&self, source: &str, deadline: Duration) -> (CollectedOutput, ExecutionOutcome) {
        let started = Instant::now();
        tracing::info!(
            "Executing {} byte program (deadline {}): {}",
            source.len(),
            describe_deadline(deadline),
            source_preview(source, LOG_PREVIEW_BYTES)
        );

        let (output, outcome) = match self.run_worker(source, deadline).await {
            Ok(WorkerRun::Finished(output, outcome)) => (output, outcome),
            Ok(WorkerRun::Overran(phase)) => {
                tracing::warn!(
                    "Worker exceeded its {} budget and was killed after {:?}",
                    phase,
                    started.elapsed()
                );
                (CollectedOutput::default(), ExecutionOutcome::timed_out(deadline))
            }
            Ok(WorkerRun::Crashed(phase)) => {
                tracing::warn!("Program crashed its worker during {}", phase);
                let outcome = match phase {
                    Phase::Compile => ExecutionOutcome::compile_error(COMPILE_CRASH_MESSAGE),
                    Phase::Execution => ExecutionOutcome::runtime_error(RUNTIME_CRASH_MESSAGE),
                };
                (CollectedOutput::default(), outcome)
            }
            Ok(WorkerRun::Exited(phase)) => (
                CollectedOutput::default(),
                ExecutionOutcome::internal(format!(
                    "worker exited during {} without reporting a result",
                    phase
                )),
            ),
            Err(e) => {
                tracing::error!("Worker execution failed: {:#}", e);
                (
                    CollectedOutput::default(),
                    ExecutionOutcome::internal(format!("{:#}", e)),
                )
            }
        };

        tracing::info!(
            "Execution finished in {:?}: {}",
            started.elapsed(),
            match outcome.error_class() {
                Some(class) => class.to_string(),
                None => "success".to_string(),
            }
        );
        if output.truncated {
            tracing::debug!("Output was truncated at {} bytes", self.config.limits.max_output_bytes);
        }

        (output, outcome)
    }

    async fn admit(&self) -> std::result::Result<OwnedSemaphorePermit, RequestError> {
        let limit = self.config.workers.max_concurrent;
        let permit = match self.config.workers.admission {
            AdmissionPolicy::Queue => self.permits.clone().acquire_owned().await.ok(),
            AdmissionPolicy::Reject => self.permits.clone().try_acquire_owned().ok(),
        };

        permit.ok_or_else(|| {
            tracing::warn!("Rejecting request: all {} worker slot(s) busy", limit);
            RequestError::Saturated { limit }
        })
    }

    async fn run_worker(&self, source: &str, deadline: Duration) -> Result<WorkerRun> {
        let limits = &self.config.limits;
        let request = WorkerRequest {
            source: source.to_string(),
            limits: limits.realm_limits(),
            memory_limit_bytes: limits.memory_limit_bytes,
        };
        let payload = serde_json::to_vec(&request).context("Failed to encode worker request")?;

        let mut child = Command::new(self.program.as_path())
            .arg("worker")
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", self.program.display()))?;
        tracing::debug!("Spawned worker pid {:?}", child.id());

        match self.drive(&mut child, payload, deadline).await {
            Ok(WorkerRun::Finished(output, outcome)) => {
                reap(&mut child).await;
                Ok(WorkerRun::Finished(output, outcome))
            }
            Ok(WorkerRun::Overran(phase)) => {
                terminate(&mut child).await;
                Ok(WorkerRun::Overran(phase))
            }
            Ok(WorkerRun::Exited(phase)) => match timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(status)) if killed_by_signal(&status) => {
                    tracing::debug!("Worker terminated by {}", status);
                    Ok(WorkerRun::Crashed(phase))
                }
                Ok(Ok(status)) => {
                    tracing::error!("Worker exited with {} before reporting a result", status);
                    Ok(WorkerRun::Exited(phase))
                }
                _ => {
                    let status = terminate(&mut child).await;
                    Err(anyhow!("Worker closed its output but did not exit ({})", status))
                }
            },
            Ok(run) => Ok(run),
            Err(e) => {
                let status = terminate(&mut child).await;
                Err(e.context(format!("worker {}", status)))
            }
        }
    }

    /// Feeds the request to the worker and reads its messages under the
    /// compile budget and then the execution deadline.
    async fn drive(&self, child: &mut Child, payload: Vec<u8>, deadline: Duration) -> Result<WorkerRun> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Worker stdout was not captured"))?;
        let mut messages = BufReader::new(stdout.take(self.protocol_byte_limit())).lines();

        let compile_budget = self.config.limits.compile_timeout();
        let first = timeout(compile_budget, async {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to send request to worker")?;
            drop(stdin);
            next_message(&mut messages).await
        })
        .await;

        let message = match first {
            Err(_) => return Ok(WorkerRun::Overran(Phase::Compile)),
            Ok(message) => message?,
        };

        let message = match message {
            None => return Ok(WorkerRun::Exited(Phase::Compile)),
            Some(WorkerMessage::Compiled) => {
                tracing::debug!("Program compiled, deadline of {} started", describe_deadline(deadline));
                match timeout(deadline, next_message(&mut messages)).await {
                    Err(_) => return Ok(WorkerRun::Overran(Phase::Execution)),
                    Ok(message) => match message? {
                        Some(message) => message,
                        None => return Ok(WorkerRun::Exited(Phase::Execution)),
                    },
                }
            }
            Some(finished) => finished,
        };

        match message {
            WorkerMessage::Finished { output, outcome } => Ok(WorkerRun::Finished(output, outcome)),
            WorkerMessage::Compiled => Err(anyhow!("Worker reported compilation twice")),
        }
    }

    /// Bound on bytes read from a worker's stdout.
    ///
    /// A `finished` message carries at most the output cap of console text
    /// plus a return value and an error description, each capped the same
    /// way. JSON escaping can expand a byte to six.
    fn protocol_byte_limit(&self) -> u64 {
        (self.config.limits.max_output_bytes as u64)
            .saturating_mul(3 * 6)
            .saturating_add(PROTOCOL_OVERHEAD_BYTES)
    }
}

/// Next protocol message, or `None` once the worker's stdout is closed.
async fn next_message<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
) -> Result<Option<WorkerMessage>> {
    match lines
        .next_line()
        .await
        .context("Failed to read from worker")?
    {
        Some(line) => WorkerMessage::from_line(&line).map(Some),
        None => Ok(None),
    }
}

#[cfg(unix)]
fn killed_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(status: &ExitStatus) -> bool {
    !status.success()
}

/// Waits briefly for a worker that has reported to exit, killing it otherwise.
async fn reap(child: &mut Child) {
    match timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) if !status.success() => {
            tracing::warn!("Worker exited with {} after reporting", status);
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!("Failed to wait for worker: {}", e),
        Err(_) => {
            tracing::warn!("Worker did not exit after reporting, killing it");
            terminate(child).await;
        }
    }
}

/// Kills the worker and waits for it, describing how it ended.
async fn terminate(child: &mut Child) -> String {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Worker kill signal not delivered: {}", e);
    }
    match timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("could not be waited on: {}", e),
        Err(_) => "did not exit after kill".to_string(),
    }
}
