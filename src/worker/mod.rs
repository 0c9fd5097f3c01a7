//! The worker participant: registers functions, grabs queued jobs, and runs
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fnv::FnvHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Connect, Error, Protocol};
use crate::proto::rpc::{InFlight, RpcQueue};
use crate::proto::{echo_payload, Command, CommandType, Connection};

mod job;
mod runner;

pub use job::Job;
pub use runner::JobRunner;

use runner::{Closure, Erase, ErasedRunner as _, SharedRunner};

/// Lifecycle notifications emitted by a [`Worker`], observable via
/// [`Worker::next_event`].
#[derive(Debug)]
#[non_exhaustive]
pub enum WorkerEvent {
    /// The server assigned a job; its runner is now executing.
    Job {
        /// The server-assigned job handle.
        handle: String,
        /// The function the job was queued under.
        function: String,
    },
    /// A server-reported or connection-level error.
    Error(Error),
    /// The connection is gone; no further events follow.
    Closed,
}

pub(crate) enum WorkerOp {
    Register {
        function: String,
        runner: SharedRunner,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Unregister {
        function: String,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    UnregisterAll {
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Ping {
        resp: oneshot::Sender<Result<(), Error>>,
    },
    /// A frame from a [`Job`] handle (progress or verdict).
    Forward { command: Command },
    /// A spawned runner returned; `error` is its rendered failure, if any.
    JobFinished { error: Option<String> },
    Close {
        resp: oneshot::Sender<()>,
    },
}

struct WorkerRpc {
    payload: Bytes,
    resp: oneshot::Sender<Result<(), Error>>,
}

impl InFlight for WorkerRpc {
    fn expects(&self) -> &'static str {
        "ECHO_RES"
    }

    fn reject(self, error: Error) {
        let _ = self.resp.send(Err(error));
    }
}

/// The grab-loop state machine.
enum GrabState {
    /// No functions registered yet; nothing to grab.
    Idle,
    /// GRAB_JOB_UNIQ sent; awaiting JOB_ASSIGN[_UNIQ] or NO_JOB.
    Grabbing,
    /// PRE_SLEEP sent; awaiting NOOP.
    Sleeping,
    /// A runner is executing the assigned job.
    Executing {
        handle: String,
        finished: Arc<AtomicBool>,
    },
}

/// A Gearman worker: registers functions with the server and executes the
/// jobs it hands back.
///
/// Like [`Client`](crate::Client), a `Worker` is a cheap handle onto a
/// per-connection actor task. The grab loop starts with the first
/// registration and alternates between grabbing, sleeping (when the server
/// has nothing queued), and executing; while a job executes the connection
/// reads nothing, since the server has nothing to say to a busy worker.
///
/// # Examples
///
/// ```no_run
/// # tokio_test::block_on(async {
/// use gearman::Worker;
/// use std::io;
///
/// let w = Worker::connect(("127.0.0.1", gearman::DEFAULT_PORT)).await.unwrap();
/// w.register_fn("reverse", |job| async move {
///     let mut out = job.workload().to_vec();
///     out.reverse();
///     job.complete(out).ok();
///     Ok::<(), io::Error>(())
/// })
/// .await
/// .unwrap();
/// # });
/// ```
pub struct Worker {
    ops: mpsc::UnboundedSender<WorkerOp>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Worker {
    /// Connect to a Gearman server.
    ///
    /// Dials `addr`, then validates the connection with an echo ping; the
    /// failure causes are distinguishable ([`Connect::Dial`] vs
    /// [`Connect::Ping`]).
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Worker, Error> {
        let stream = TcpStream::connect(addr).await.map_err(Connect::Dial)?;
        Worker::connect_with(stream).await
    }

    /// Connect over an already-established stream.
    pub async fn connect_with<S>(stream: S) -> Result<Worker, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            WorkerActor::new(Connection::new(stream), ops_rx, ops_tx.clone(), events_tx).run(),
        );

        let worker = Worker {
            ops: ops_tx,
            events: events_rx,
        };
        worker
            .ping()
            .await
            .map_err(|e| Connect::Ping(Box::new(e)))?;
        Ok(worker)
    }

    /// Register a function with the server and store its runner.
    ///
    /// Sends CAN_DO and resolves once the frame is flushed; the server
    /// answers nothing for registrations. The first registration starts
    /// the grab loop. Registering a name again replaces its runner.
    pub async fn register<R>(&self, function: impl Into<String>, runner: R) -> Result<(), Error>
    where
        R: JobRunner + 'static,
        R::Error: std::fmt::Display,
    {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(WorkerOp::Register {
                function: function.into(),
                runner: Arc::new(Erase(runner)),
                resp: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Register an async closure as a function's runner.
    pub async fn register_fn<F, Fut, E>(
        &self,
        function: impl Into<String>,
        runner: F,
    ) -> Result<(), Error>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        self.register(function, Closure(runner)).await
    }

    /// Tell the server this worker no longer performs `function` (CANT_DO)
    /// and drop its runner.
    pub async fn unregister(&self, function: impl Into<String>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(WorkerOp::Unregister {
                function: function.into(),
                resp: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Drop every registration at once (RESET_ABILITIES).
    pub async fn unregister_all(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(WorkerOp::UnregisterAll { resp: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Verify the connection with an echo round-trip.
    pub async fn ping(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(WorkerOp::Ping { resp: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// The next lifecycle event, if the connection is still alive.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Close the connection. A still-executing runner keeps running, but
    /// its job operations fail with [`Error::ConnectionClosed`].
    pub async fn disconnect(self) {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(WorkerOp::Close { resp: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct WorkerActor<S> {
    conn: Connection<S>,
    ops: mpsc::UnboundedReceiver<WorkerOp>,
    ops_tx: mpsc::UnboundedSender<WorkerOp>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    rpcs: RpcQueue<WorkerRpc>,
    functions: FnvHashMap<String, SharedRunner>,
    state: GrabState,
    close_ack: Option<oneshot::Sender<()>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> WorkerActor<S> {
    fn new(
        conn: Connection<S>,
        ops: mpsc::UnboundedReceiver<WorkerOp>,
        ops_tx: mpsc::UnboundedSender<WorkerOp>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerActor<S> {
        WorkerActor {
            conn,
            ops,
            ops_tx,
            events,
            rpcs: RpcQueue::new(),
            functions: FnvHashMap::default(),
            state: GrabState::Idle,
            close_ack: None,
        }
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        self.shutdown(outcome.err());
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            let reading = self.reading();
            tokio::select! {
                biased;
                op = self.ops.recv() => match op {
                    None => return Ok(()),
                    Some(WorkerOp::Close { resp }) => {
                        self.close_ack = Some(resp);
                        return Ok(());
                    }
                    Some(op) => self.handle_op(op).await?,
                },
                command = self.conn.read_command(), if reading => {
                    self.handle_command(command?).await?;
                }
            }
        }
    }

    /// The read side runs iff the server owes this worker a frame: a grab
    /// answer, a NOOP wake-up, or an echo response.
    fn reading(&self) -> bool {
        matches!(self.state, GrabState::Grabbing | GrabState::Sleeping) || !self.rpcs.is_empty()
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_op(&mut self, op: WorkerOp) -> Result<(), Error> {
        match op {
            WorkerOp::Register {
                function,
                runner,
                resp,
            } => {
                let command = Command::request(
                    CommandType::CanDo,
                    [("function_name", Bytes::copy_from_slice(function.as_bytes()))],
                );
                match command {
                    Ok(command) => {
                        self.conn.send(&command).await?;
                        self.functions.insert(function, runner);
                        let _ = resp.send(Ok(()));
                        if matches!(self.state, GrabState::Idle) {
                            self.grab().await?;
                        }
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            WorkerOp::Unregister { function, resp } => {
                let command = Command::request(
                    CommandType::CantDo,
                    [("function_name", Bytes::copy_from_slice(function.as_bytes()))],
                );
                match command {
                    Ok(command) => {
                        self.conn.send(&command).await?;
                        self.functions.remove(&function);
                        let _ = resp.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            WorkerOp::UnregisterAll { resp } => {
                let command = Command::request(CommandType::ResetAbilities, [])?;
                self.conn.send(&command).await?;
                self.functions.clear();
                let _ = resp.send(Ok(()));
            }
            WorkerOp::Ping { resp } => {
                let payload = echo_payload();
                let command =
                    Command::request(CommandType::EchoReq, [("data", payload.clone())])?;
                self.conn.send(&command).await?;
                self.rpcs.push(WorkerRpc { payload, resp });
            }
            WorkerOp::Forward { command } => {
                self.conn.send(&command).await?;
            }
            WorkerOp::JobFinished { error } => {
                let state = std::mem::replace(&mut self.state, GrabState::Idle);
                let GrabState::Executing { handle, finished } = state else {
                    tracing::warn!("runner finished with no job executing");
                    return Ok(());
                };
                if !finished.swap(true, Ordering::SeqCst) {
                    // the runner never gave a verdict; supply the default
                    match error {
                        None => self.send_empty_complete(&handle).await?,
                        Some(text) => {
                            tracing::warn!(%handle, %text, "runner failed; reporting exception");
                            self.send_exception(&handle, &text).await?;
                        }
                    }
                }
                self.grab().await?;
            }
            WorkerOp::Close { resp } => {
                self.close_ack = Some(resp);
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        match command.kind() {
            CommandType::EchoRes => {
                let rpc = self.rpcs.take_head(command.name())?;
                let received = command.arg("data").cloned().unwrap_or_default();
                if received != rpc.payload {
                    let mismatch = || Protocol::ResponseMismatch {
                        command: "ECHO_RES",
                        sent: format!("{:?}", rpc.payload),
                        received: format!("{received:?}"),
                    };
                    let _ = rpc.resp.send(Err(mismatch().into()));
                    return Err(mismatch().into());
                }
                let _ = rpc.resp.send(Ok(()));
                Ok(())
            }
            CommandType::Error => {
                let code = command.arg_str("code")?.to_string();
                let text = command.arg_str("text")?.to_string();
                tracing::warn!(%code, %text, "server reported an error");
                self.rpcs.reject_head(
                    Protocol::Server {
                        code: code.clone(),
                        text: text.clone(),
                    }
                    .into(),
                );
                self.emit(WorkerEvent::Error(Protocol::Server { code, text }.into()));
                Ok(())
            }
            CommandType::Noop => {
                if matches!(self.state, GrabState::Sleeping) {
                    self.grab().await?;
                }
                Ok(())
            }
            CommandType::NoJob => {
                if matches!(self.state, GrabState::Grabbing) {
                    self.sleep().await?;
                } else {
                    tracing::warn!("NO_JOB arrived outside a grab");
                }
                Ok(())
            }
            CommandType::JobAssign | CommandType::JobAssignUniq => self.assign(command).await,
            other => {
                tracing::warn!(command = other.name(), "ignoring command meant for a client");
                Ok(())
            }
        }
    }

    async fn assign(&mut self, command: Command) -> Result<(), Error> {
        if !matches!(self.state, GrabState::Grabbing) {
            tracing::warn!(
                command = command.name(),
                "unsolicited job assignment; ignoring"
            );
            return Ok(());
        }

        let handle = command.arg_str("handle")?.to_string();
        let function = command.arg_str("function_name")?.to_string();
        let unique_id = if command.kind() == CommandType::JobAssignUniq {
            command.arg_str("unique_id")?.to_string()
        } else {
            String::new()
        };
        let workload = command.arg("data").cloned().unwrap_or_default();

        let Some(runner) = self.functions.get(&function) else {
            // can happen when an assignment races an unregister
            tracing::warn!(%handle, %function, "assigned a job for an unregistered function");
            self.send_exception(&handle, &format!("no runner registered for {function}"))
                .await?;
            return self.grab().await;
        };
        let runner = Arc::clone(runner);

        let finished = Arc::new(AtomicBool::new(false));
        let job = Job::new(
            handle.clone(),
            function.clone(),
            unique_id,
            workload,
            self.ops_tx.clone(),
            Arc::clone(&finished),
        );
        tracing::debug!(%handle, %function, "job assigned");
        self.emit(WorkerEvent::Job {
            handle: handle.clone(),
            function,
        });
        self.state = GrabState::Executing { handle, finished };

        let ops = self.ops_tx.clone();
        tokio::spawn(async move {
            let error = runner.run_erased(job).await;
            let _ = ops.send(WorkerOp::JobFinished { error });
        });
        Ok(())
    }

    async fn grab(&mut self) -> Result<(), Error> {
        let command = Command::request(CommandType::GrabJobUniq, [])?;
        self.conn.send(&command).await?;
        self.state = GrabState::Grabbing;
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), Error> {
        let command = Command::request(CommandType::PreSleep, [])?;
        self.conn.send(&command).await?;
        self.state = GrabState::Sleeping;
        Ok(())
    }

    /// The default verdict for a runner that returned `Ok` without one.
    async fn send_empty_complete(&mut self, handle: &str) -> Result<(), Error> {
        let command = Command::request(
            CommandType::WorkComplete,
            [
                ("handle", Bytes::copy_from_slice(handle.as_bytes())),
                ("data", Bytes::new()),
            ],
        )?;
        self.conn.send(&command).await
    }

    /// Report a failed job: WORK_EXCEPTION with the reason, then WORK_FAIL
    /// so clients without the exceptions option still see the failure.
    async fn send_exception(&mut self, handle: &str, text: &str) -> Result<(), Error> {
        let exception = Command::request(
            CommandType::WorkException,
            [
                ("handle", Bytes::copy_from_slice(handle.as_bytes())),
                ("data", Bytes::copy_from_slice(text.as_bytes())),
            ],
        )?;
        self.conn.send(&exception).await?;
        let fail = Command::request(
            CommandType::WorkFail,
            [("handle", Bytes::copy_from_slice(handle.as_bytes()))],
        )?;
        self.conn.send(&fail).await
    }

    fn shutdown(mut self, error: Option<Error>) {
        let cause = match &error {
            Some(Error::Protocol(p)) => Some(p.clone()),
            _ => None,
        };
        if let Some(error) = error {
            tracing::debug!(%error, "worker connection terminating");
            self.emit(WorkerEvent::Error(error));
        }
        self.rpcs.reject_all(|| {
            cause
                .clone()
                .map(Error::Protocol)
                .unwrap_or(Error::ConnectionClosed)
        });
        self.emit(WorkerEvent::Closed);
        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(());
        }
    }
}
