//! Asynchronous job-completion protocol.
//!
//! A method invocation returns immediately with a numeric code and, when the
//! operation is long-running, a handle to a pending job. [`resolve`] turns
//! that two-shaped result into a single [`JobOutcome`] by classifying the
//! return code and, when a job was started, polling its state to a terminal
//! condition.
//!
//! The loop is a small finite-state machine: `Running` (and any
//! unrecognized state) stays in the loop, bounded by the caller's timeout;
//! each terminal state maps to exactly one outcome branch. The handle is
//! released exactly once on every branch, enforced by the consuming
//! [`JobHandle::release`] signature.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::error::HvError;
use crate::session::JobHandle;

/// Return code for an operation that completed synchronously.
pub const RET_COMPLETED: i32 = 0;
/// Return code for an operation that started a job.
pub const RET_JOB_STARTED: i32 = 4096;

const STATE_RUNNING: u16 = 4;
const STATE_COMPLETED: u16 = 7;
const STATE_TERMINATED: u16 = 8;
const STATE_KILLED: u16 = 9;
const STATE_EXCEPTION: u16 = 10;
const STATE_COMPLETED_WITH_WARNINGS: u16 = 32768;

/// Classification of the synchronous return code of a method invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// Operation fully completed; no job.
    Completed,
    /// Operation pending; a job handle accompanies this code.
    JobStarted,
    /// Operation failed synchronously; the code is the error detail.
    Failed(i32),
}

impl ReturnCode {
    pub fn classify(raw: i32) -> Self {
        match raw {
            RET_COMPLETED => ReturnCode::Completed,
            RET_JOB_STARTED => ReturnCode::JobStarted,
            other => ReturnCode::Failed(other),
        }
    }
}

/// Status read repeatedly from a pending job.
///
/// Values outside the known set map to [`JobState::Other`] and are treated
/// as still running, bounded by the poll timeout. Protocol drift must never
/// be silently classified as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    CompletedSuccessfully,
    CompletedWithWarnings,
    Terminated,
    Killed,
    ExceptionRaised,
    Other(u16),
}

impl JobState {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            STATE_RUNNING => JobState::Running,
            STATE_COMPLETED => JobState::CompletedSuccessfully,
            STATE_TERMINATED => JobState::Terminated,
            STATE_KILLED => JobState::Killed,
            STATE_EXCEPTION => JobState::ExceptionRaised,
            STATE_COMPLETED_WITH_WARNINGS => JobState::CompletedWithWarnings,
            other => JobState::Other(other),
        }
    }

    /// True once no further state transition will occur.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::CompletedSuccessfully
                | JobState::CompletedWithWarnings
                | JobState::Terminated
                | JobState::Killed
                | JobState::ExceptionRaised
        )
    }

    /// Generic failure message used when the job exposes no description.
    fn generic_failure(self) -> &'static str {
        match self {
            JobState::Terminated => "job was terminated",
            JobState::Killed => "job was killed",
            JobState::ExceptionRaised => "job raised an exception",
            _ => "job failed",
        }
    }
}

/// How a resolve call polls: the sleep between state reads and the overall
/// deadline after which it gives up locally.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Why a resolve call produced a failure outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Synchronous non-zero return code; no job was started.
    Immediate,
    /// The job reached a failing terminal state.
    Remote,
    /// Local timeout expired while the job was still non-terminal. The
    /// remote operation's true outcome is unknown and it keeps running.
    Timeout,
    /// Lost the ability to observe the job mid-poll.
    Transport,
    /// The invocation result violated the protocol contract (a job-started
    /// code with no handle).
    ProtocolMismatch,
}

/// A failure outcome, carrying the numeric code and remote description when
/// available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub code: Option<i32>,
    pub description: Option<String>,
}

impl JobFailure {
    pub(crate) fn immediate(code: i32) -> Self {
        Self {
            kind: FailureKind::Immediate,
            code: Some(code),
            description: None,
        }
    }

    pub(crate) fn remote(code: Option<i32>, description: String) -> Self {
        Self {
            kind: FailureKind::Remote,
            code,
            description: Some(description),
        }
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            code: None,
            description: Some(format!("operation still in progress after {:?}", timeout)),
        }
    }

    pub(crate) fn transport(err: &HvError) -> Self {
        Self {
            kind: FailureKind::Transport,
            code: None,
            description: Some(err.to_string()),
        }
    }

    pub(crate) fn protocol_mismatch() -> Self {
        Self {
            kind: FailureKind::ProtocolMismatch,
            code: None,
            description: None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Immediate => {
                write!(f, "operation returned failure code {}", self.code.unwrap_or(-1))
            }
            FailureKind::Remote => {
                let desc = self.description.as_deref().unwrap_or("job failed");
                match self.code {
                    Some(code) => write!(f, "job failed with code {}: {}", code, desc),
                    None => f.write_str(desc),
                }
            }
            FailureKind::Timeout => f.write_str(
                self.description
                    .as_deref()
                    .unwrap_or("operation still in progress at timeout"),
            ),
            FailureKind::Transport => write!(
                f,
                "lost contact with job: {}",
                self.description.as_deref().unwrap_or("unknown transport error")
            ),
            FailureKind::ProtocolMismatch => f.write_str(
                "management service reported a pending job but returned no job handle",
            ),
        }
    }
}

/// The single terminal result of one method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The operation succeeded, possibly with non-fatal warning text.
    /// Callers must not fail the overall operation on warnings alone.
    Success { warning: Option<String> },
    Failure(JobFailure),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }

    /// Convert into a result, keeping any warning text on the success arm.
    pub fn into_result(self) -> Result<Option<String>, JobFailure> {
        match self {
            JobOutcome::Success { warning } => Ok(warning),
            JobOutcome::Failure(failure) => Err(failure),
        }
    }

    /// Treat this outcome as the result of the named operation.
    ///
    /// Success with warnings stays a success; the warning text is logged and
    /// must not fail the operation. A failure keeps its underlying code and
    /// description inside [`crate::error::HvError::Operation`].
    pub fn into_operation(self, what: &str) -> crate::error::HvResult<()> {
        match self.into_result() {
            Ok(Some(warning)) => {
                tracing::warn!(warning = %warning, what, "operation completed with warnings");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(failure) => Err(crate::error::HvError::operation(what, failure)),
        }
    }
}

/// Resolve a method invocation's `(return_code, job)` pair into a single
/// [`JobOutcome`], polling the job to a terminal state when one was started.
///
/// The timeout is a local give-up: polling stops and a
/// [`FailureKind::Timeout`] outcome is produced, but the remote operation
/// keeps running and is not cancelled. If a handle was supplied it is
/// released exactly once, whatever the outcome.
pub async fn resolve(
    return_code: i32,
    job: Option<Box<dyn JobHandle>>,
    settings: &PollSettings,
) -> JobOutcome {
    match ReturnCode::classify(return_code) {
        ReturnCode::Completed => {
            if let Some(job) = job {
                // Contract says no job accompanies a completed code, but a
                // supplied handle still has to be released.
                tracing::warn!("completed return code arrived with a job handle");
                release_quietly(job).await;
            }
            JobOutcome::Success { warning: None }
        }
        ReturnCode::Failed(code) => {
            if let Some(job) = job {
                tracing::warn!(code, "failure return code arrived with a job handle");
                release_quietly(job).await;
            }
            tracing::debug!(code, "operation failed synchronously");
            JobOutcome::Failure(JobFailure::immediate(code))
        }
        ReturnCode::JobStarted => match job {
            None => {
                tracing::error!("job-started return code with no job handle");
                JobOutcome::Failure(JobFailure::protocol_mismatch())
            }
            Some(mut job) => {
                let outcome = poll_until_terminal(job.as_mut(), settings).await;
                release_quietly(job).await;
                outcome
            }
        },
    }
}

/// Poll the job to a terminal condition and translate it into an outcome.
///
/// State reads are strictly sequential; the sleep between reads is the only
/// suspension point.
async fn poll_until_terminal(job: &mut dyn JobHandle, settings: &PollSettings) -> JobOutcome {
    let started = Instant::now();
    loop {
        let state = match job.state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "lost contact with job while polling");
                return JobOutcome::Failure(JobFailure::transport(&e));
            }
        };

        match state {
            JobState::CompletedSuccessfully => {
                let warning = read_warning(job).await;
                tracing::debug!(warning = ?warning, "job completed successfully");
                return JobOutcome::Success { warning };
            }
            JobState::CompletedWithWarnings => {
                let warning = read_warning(job).await;
                tracing::warn!(warning = ?warning, "job completed with warnings");
                return JobOutcome::Success { warning };
            }
            JobState::Terminated | JobState::Killed | JobState::ExceptionRaised => {
                return failure_from_handle(job, state).await;
            }
            JobState::Running | JobState::Other(_) => {
                if let JobState::Other(raw) = state {
                    tracing::debug!(raw, "unrecognized job state, treating as running");
                }
                sleep(settings.interval).await;
                if started.elapsed() >= settings.timeout {
                    tracing::warn!(
                        timeout = ?settings.timeout,
                        "giving up on job locally; the remote operation keeps running"
                    );
                    return JobOutcome::Failure(JobFailure::timeout(settings.timeout));
                }
            }
        }
    }
}

/// Read error code and description off a job in a failing terminal state.
async fn failure_from_handle(job: &mut dyn JobHandle, state: JobState) -> JobOutcome {
    let code = match job.error_code().await {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(error = %e, "lost contact with job while reading error code");
            return JobOutcome::Failure(JobFailure::transport(&e));
        }
    };
    let description = match job.error_description().await {
        Ok(description) => description,
        Err(e) => {
            tracing::warn!(error = %e, "lost contact with job while reading error description");
            return JobOutcome::Failure(JobFailure::transport(&e));
        }
    };

    let description = description
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| state.generic_failure().to_string());
    tracing::debug!(state = ?state, code = ?code, description = %description, "job failed");
    JobOutcome::Failure(JobFailure::remote(code, description))
}

/// Warning text is best-effort: a read failure here must not turn a
/// successful job into a failure.
async fn read_warning(job: &mut dyn JobHandle) -> Option<String> {
    match job.error_description().await {
        Ok(description) => description.filter(|d| !d.is_empty()),
        Err(e) => {
            tracing::debug!(error = %e, "could not read warning text from completed job");
            None
        }
    }
}

async fn release_quietly(job: Box<dyn JobHandle>) {
    if let Err(e) = job.release().await {
        tracing::warn!(error = %e, "failed to release job handle");
    }
}
