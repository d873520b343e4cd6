//! Worker process side of the execution protocol.
//!
//! Each execution request runs in its own short-lived worker process (the
//! `scriptbox worker` subcommand). The host writes one [`WorkerRequest`] as
//! JSON on the worker's stdin and closes it. The worker answers on stdout
//! with newline-delimited [`WorkerMessage`]s:
//!
//! ```text
//! host -> worker   {"source": "...", "limits": {...}, "memory_limit_bytes": ...}
//! worker -> host   {"event":"compiled"}
//! worker -> host   {"event":"finished","output":{...},"outcome":{...}}
//! ```
//!
//! `compiled` is sent once the program has parsed; the host starts the
//! execution deadline when it sees it. A program that fails to parse skips
//! straight to `finished`. A worker that dies before `finished` (killed at the
//! deadline, out of memory, crashed) simply closes stdout.
//!
//! Stdout carries nothing but protocol messages; diagnostics go to stderr.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;

use crate::sandbox::collector::CollectedOutput;
use crate::sandbox::outcome::ExecutionOutcome;
use crate::sandbox::realm::{RealmBuilder, RealmLimits};

/// Upper bound on the request document a worker accepts on stdin.
const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

/// Stack reserved for the realm thread. The parser, the garbage collector
/// and native builtins recurse on the Rust stack.
pub const REALM_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Job description sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerRequest {
    pub source: String,
    pub limits: RealmLimits,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

/// Progress and result messages sent from a worker to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The program parsed; execution starts now.
    Compiled,
    /// Execution ended. Always the last message.
    Finished {
        output: CollectedOutput,
        outcome: ExecutionOutcome,
    },
}

impl WorkerMessage {
    /// Parses one protocol line.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("Malformed worker message")
    }

    fn write_to(&self, out: &mut impl Write) -> Result<()> {
        serde_json::to_writer(&mut *out, self).context("Failed to encode worker message")?;
        out.write_all(b"\n")
            .and_then(|_| out.flush())
            .context("Failed to write worker message")
    }
}

/// Entry point of the worker process.
///
/// Reads the request from `input`, runs it in a fresh realm and reports on
/// `output`. Realm construction failures are reported as an
/// `InternalFailure` outcome rather than an error, so the host always gets a
/// classified result when the worker survives long enough to send one.
///
/// # Errors
///
/// Returns an error only if the request cannot be read or decoded, or the
/// protocol stream cannot be written.
pub fn run_worker(input: impl Read, mut output: impl Write) -> Result<()> {
    let mut raw = String::new();
    input
        .take(MAX_REQUEST_BYTES)
        .read_to_string(&mut raw)
        .context("Failed to read worker request from stdin")?;
    let request: WorkerRequest =
        serde_json::from_str(&raw).context("Failed to parse worker request")?;
    drop(raw);

    if let Err(e) = apply_resource_limits(request.memory_limit_bytes) {
        tracing::error!("Failed to apply worker resource limits: {:#}", e);
        return WorkerMessage::Finished {
            output: CollectedOutput::default(),
            outcome: ExecutionOutcome::internal(format!("resource limits: {:#}", e)),
        }
        .write_to(&mut output);
    }

    let (sender, messages) = mpsc::channel();
    let realm_thread = thread::Builder::new()
        .name("realm".to_string())
        .stack_size(REALM_STACK_BYTES)
        .spawn(move || run_realm(request, sender))
        .context("Failed to start realm thread")?;

    let mut finished = false;
    for message in messages {
        finished |= matches!(message, WorkerMessage::Finished { .. });
        message.write_to(&mut output)?;
    }

    if realm_thread.join().is_err() || !finished {
        tracing::error!("Realm thread ended without a result");
        return WorkerMessage::Finished {
            output: CollectedOutput::default(),
            outcome: ExecutionOutcome::internal("realm thread ended without a result"),
        }
        .write_to(&mut output);
    }

    Ok(())
}

/// Builds a realm, compiles and runs the program, reporting progress on
/// `sender`. Runs on the dedicated realm thread.
fn run_realm(request: WorkerRequest, sender: mpsc::Sender<WorkerMessage>) {
    // The receiver outlives this thread, so sends only fail if the worker
    // is already tearing down.
    let report = |message: WorkerMessage| {
        let _ = sender.send(message);
    };

    let mut realm = match RealmBuilder::new(request.limits).build() {
        Ok(realm) => realm,
        Err(e) => {
            tracing::error!("Failed to build sandbox realm: {:#}", e);
            report(WorkerMessage::Finished {
                output: CollectedOutput::default(),
                outcome: ExecutionOutcome::internal(format!("realm build: {:#}", e)),
            });
            return;
        }
    };

    let outcome = match realm.compile(&request.source) {
        Ok(script) => {
            report(WorkerMessage::Compiled);
            realm.execute(&script)
        }
        Err(outcome) => outcome,
    };

    report(WorkerMessage::Finished {
        output: realm.finish(),
        outcome,
    });
}

/// Caps the worker's own address space and disables core dumps.
#[cfg(unix)]
fn apply_resource_limits(memory_limit_bytes: Option<u64>) -> Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CORE, 0, 0).context("setrlimit(RLIMIT_CORE) failed")?;

    if let Some(limit) = memory_limit_bytes {
        setrlimit(Resource::RLIMIT_AS, limit, limit).context("setrlimit(RLIMIT_AS) failed")?;
    }

    Ok(())
}

#[cfg(not(unix))]
fn apply_resource_limits(memory_limit_bytes: Option<u64>) -> Result<()> {
    if memory_limit_bytes.is_some() {
        tracing::warn!("Worker memory limits are not supported on this platform");
    }
    Ok(())
}
