use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::WorkerOp;
use crate::error::Error;
use crate::proto::{Command, CommandType};

/// A worker-side handle to an assigned job.
///
/// Handed to the registered [`JobRunner`](crate::JobRunner) when the server
/// assigns work. Progress and verdicts flow back to the server through this
/// handle; all sends are fire-and-forget (the server answers none of them).
///
/// A job ends with exactly one terminal verdict: [`complete`](Job::complete),
/// [`fail`](Job::fail), or [`exception`](Job::exception). Every operation
/// after that fails with [`Error::JobFinished`]. A runner that returns
/// without giving a verdict gets one supplied: success completes the job
/// with an empty payload, an error is reported as an exception.
#[derive(Debug, Clone)]
pub struct Job {
    handle: String,
    function: String,
    unique_id: String,
    workload: Bytes,
    ops: mpsc::UnboundedSender<WorkerOp>,
    finished: Arc<AtomicBool>,
}

impl Job {
    pub(crate) fn new(
        handle: String,
        function: String,
        unique_id: String,
        workload: Bytes,
        ops: mpsc::UnboundedSender<WorkerOp>,
        finished: Arc<AtomicBool>,
    ) -> Job {
        Job {
            handle,
            function,
            unique_id,
            workload,
            ops,
            finished,
        }
    }

    /// The server-assigned job handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The function name this job was queued under.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The submitter's deduplication key. Empty unless the job arrived via
    /// JOB_ASSIGN_UNIQ.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// The opaque workload attached to the job.
    pub fn workload(&self) -> &Bytes {
        &self.workload
    }

    /// Send intermediate data to the submitting client (WORK_DATA).
    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.ensure_live()?;
        self.forward(CommandType::WorkData, data.into())
    }

    /// Send a warning to the submitting client (WORK_WARNING).
    pub fn send_warning(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.ensure_live()?;
        self.forward(CommandType::WorkWarning, data.into())
    }

    /// Report progress to the server (WORK_STATUS).
    pub fn send_status(&self, numerator: u64, denominator: u64) -> Result<(), Error> {
        self.ensure_live()?;
        let command = Command::request(
            CommandType::WorkStatus,
            [
                ("handle", Bytes::copy_from_slice(self.handle.as_bytes())),
                ("numerator", Bytes::from(numerator.to_string())),
                ("denominator", Bytes::from(denominator.to_string())),
            ],
        )?;
        self.dispatch(command)
    }

    /// Finish the job successfully with `result` (WORK_COMPLETE). Terminal.
    pub fn complete(&self, result: impl Into<Bytes>) -> Result<(), Error> {
        self.finish()?;
        self.forward(CommandType::WorkComplete, result.into())
    }

    /// Finish the job as failed, with no payload (WORK_FAIL). Terminal.
    pub fn fail(&self) -> Result<(), Error> {
        self.finish()?;
        let command = Command::request(
            CommandType::WorkFail,
            [("handle", Bytes::copy_from_slice(self.handle.as_bytes()))],
        )?;
        self.dispatch(command)
    }

    /// Finish the job with an exception payload (WORK_EXCEPTION). Terminal.
    ///
    /// Only clients that enabled the `exceptions` option see the payload;
    /// the job is failed either way.
    pub fn exception(&self, reason: impl Into<Bytes>) -> Result<(), Error> {
        self.finish()?;
        self.forward(CommandType::WorkException, reason.into())?;
        // the job must still read as failed to clients without the option
        let fail = Command::request(
            CommandType::WorkFail,
            [("handle", Bytes::copy_from_slice(self.handle.as_bytes()))],
        )?;
        self.dispatch(fail)
    }

    fn forward(&self, kind: CommandType, data: Bytes) -> Result<(), Error> {
        let command = Command::request(
            kind,
            [
                ("handle", Bytes::copy_from_slice(self.handle.as_bytes())),
                ("data", data),
            ],
        )?;
        self.dispatch(command)
    }

    fn dispatch(&self, command: Command) -> Result<(), Error> {
        self.ops
            .send(WorkerOp::Forward { command })
            .map_err(|_| Error::ConnectionClosed)
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Error::JobFinished);
        }
        Ok(())
    }

    /// Claim the single terminal verdict.
    fn finish(&self) -> Result<(), Error> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(Error::JobFinished);
        }
        Ok(())
    }
}
