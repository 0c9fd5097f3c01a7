use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::proto::CommandType;

/// Scheduling priority for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Served after all normal- and high-priority jobs.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Served before all normal- and low-priority jobs.
    High,
}

impl Priority {
    /// The SUBMIT_JOB variant for this priority and foreground/background
    /// choice.
    pub(crate) fn submit_kind(self, background: bool) -> CommandType {
        match (self, background) {
            (Priority::Low, false) => CommandType::SubmitJobLow,
            (Priority::Normal, false) => CommandType::SubmitJob,
            (Priority::High, false) => CommandType::SubmitJobHigh,
            (Priority::Low, true) => CommandType::SubmitJobLowBg,
            (Priority::Normal, true) => CommandType::SubmitJobBg,
            (Priority::High, true) => CommandType::SubmitJobHighBg,
        }
    }
}

/// A server-initiated notification about a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkEvent {
    /// Intermediate data from the worker (WORK_DATA).
    Data(Bytes),
    /// A warning from the worker (WORK_WARNING).
    Warning(Bytes),
    /// A progress report (WORK_STATUS, or a GET_STATUS answer routed to
    /// this task).
    Status {
        /// Progress numerator.
        numerator: u64,
        /// Progress denominator.
        denominator: u64,
        /// Whether the server knows the job. Always true for WORK_STATUS.
        known: bool,
        /// Whether the job is currently running. Always true for
        /// WORK_STATUS.
        running: bool,
    },
    /// The job finished successfully with this result (WORK_COMPLETE).
    /// Terminal.
    Complete(Bytes),
    /// The job failed without a payload (WORK_FAIL). Terminal.
    Fail,
    /// The job raised an exception with this payload (WORK_EXCEPTION), or
    /// the connection to the server was lost. Terminal.
    Exception(Bytes),
}

impl WorkEvent {
    /// Whether this event ends the task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkEvent::Complete(_) | WorkEvent::Fail | WorkEvent::Exception(_)
        )
    }
}

/// A point-in-time answer to [`Client::get_status`](crate::Client::get_status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// The job handle the status describes.
    pub handle: String,
    /// Whether the server knows a job by this handle.
    pub known: bool,
    /// Whether a worker is currently running the job.
    pub running: bool,
    /// Progress numerator, as last reported by the worker.
    pub numerator: u64,
    /// Progress denominator, as last reported by the worker.
    pub denominator: u64,
}

/// The ways a task can end other than completing.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskFailure {
    /// The worker reported WORK_FAIL.
    #[error("job failed")]
    Failed,
    /// The worker reported WORK_EXCEPTION (or the connection was lost, in
    /// which case the payload reads `Lost connection`).
    #[error("job raised an exception: {0:?}")]
    Exception(Bytes),
    /// The task was cancelled locally before reaching a terminal event.
    #[error("task was cancelled")]
    Cancelled,
}

/// A client-side handle to a submitted job.
///
/// Created once the server acknowledges the submission with JOB_CREATED.
/// Work events for the job's handle arrive on this object in server order;
/// after a terminal event the client forgets the handle and the event
/// stream ends. Background tasks carry a handle but never receive events.
#[derive(Debug)]
pub struct Task {
    function: String,
    workload: Bytes,
    handle: String,
    priority: Priority,
    unique_id: String,
    events: mpsc::UnboundedReceiver<WorkEvent>,
}

impl Task {
    pub(crate) fn new(
        function: String,
        workload: Bytes,
        handle: String,
        priority: Priority,
        unique_id: String,
        events: mpsc::UnboundedReceiver<WorkEvent>,
    ) -> Task {
        Task {
            function,
            workload,
            handle,
            priority,
            unique_id,
            events,
        }
    }

    /// The function name the job was submitted under.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The opaque workload the job was submitted with.
    pub fn workload(&self) -> &Bytes {
        &self.workload
    }

    /// The server-assigned job handle, e.g. `H:lap:1`.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The priority the job was submitted with.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The deduplication key for this submission (generated if one was not
    /// supplied).
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// The next work event for this task, in server order.
    ///
    /// Returns `None` after a terminal event has been delivered, after
    /// [`Client::cancel`](crate::Client::cancel), or for background tasks.
    pub async fn next_event(&mut self) -> Option<WorkEvent> {
        self.events.recv().await
    }

    /// Drain events until the task ends, discarding progress, and return
    /// the completion payload.
    pub async fn wait_result(mut self) -> Result<Bytes, TaskFailure> {
        loop {
            match self.events.recv().await {
                Some(WorkEvent::Complete(data)) => return Ok(data),
                Some(WorkEvent::Fail) => return Err(TaskFailure::Failed),
                Some(WorkEvent::Exception(data)) => return Err(TaskFailure::Exception(data)),
                Some(_) => continue,
                None => return Err(TaskFailure::Cancelled),
            }
        }
    }
}
