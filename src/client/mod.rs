//! The client participant: submits jobs and tracks them to completion.

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Connect, Error, Protocol};
use crate::proto::rpc::{InFlight, RpcQueue};
use crate::proto::{echo_payload, Command, CommandType, Connection};

mod task;

pub use task::{JobStatus, Priority, Task, TaskFailure, WorkEvent};

/// The only connection option gearmand recognizes from clients.
const OPTION_EXCEPTIONS: &str = "exceptions";

/// Lifecycle notifications emitted by a [`Client`], observable via
/// [`Client::next_event`].
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    /// A foreground submission was acknowledged with this handle.
    Submitted {
        /// The server-assigned handle.
        handle: String,
    },
    /// A work event arrived for a handle this client is not tracking
    /// (e.g. for a background job, or after a task was cancelled).
    UnknownHandle {
        /// The handle the server referenced.
        handle: String,
        /// The command that referenced it.
        command: &'static str,
    },
    /// A status answer arrived (every GET_STATUS answer is mirrored here).
    Status(JobStatus),
    /// The server confirmed a connection option.
    Option {
        /// The confirmed option name.
        option: String,
    },
    /// A server-reported or connection-level error.
    Error(Error),
    /// The connection is gone; no further events follow.
    Closed,
}

enum ClientOp {
    Submit {
        function: String,
        workload: Bytes,
        priority: Priority,
        unique_id: String,
        background: bool,
        resp: oneshot::Sender<Result<Task, Error>>,
    },
    SetOption {
        option: String,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    GetStatus {
        handle: String,
        resp: oneshot::Sender<Result<JobStatus, Error>>,
    },
    Ping {
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Wait {
        resp: oneshot::Sender<()>,
    },
    Cancel {
        handle: String,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// An in-flight client RPC, queued until its correlated response arrives.
enum ClientRpc {
    Echo {
        payload: Bytes,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Submit {
        function: String,
        workload: Bytes,
        priority: Priority,
        unique_id: String,
        background: bool,
        resp: oneshot::Sender<Result<Task, Error>>,
    },
    Option {
        option: String,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Status {
        handle: String,
        resp: oneshot::Sender<Result<JobStatus, Error>>,
    },
}

impl InFlight for ClientRpc {
    fn expects(&self) -> &'static str {
        match self {
            ClientRpc::Echo { .. } => "ECHO_RES",
            ClientRpc::Submit { .. } => "JOB_CREATED",
            ClientRpc::Option { .. } => "OPTION_RES",
            ClientRpc::Status { .. } => "STATUS_RES",
        }
    }

    fn reject(self, error: Error) {
        match self {
            ClientRpc::Echo { resp, .. } => {
                let _ = resp.send(Err(error));
            }
            ClientRpc::Submit { resp, .. } => {
                let _ = resp.send(Err(error));
            }
            ClientRpc::Option { resp, .. } => {
                let _ = resp.send(Err(error));
            }
            ClientRpc::Status { resp, .. } => {
                let _ = resp.send(Err(error));
            }
        }
    }
}

struct TaskEntry {
    function: String,
    unique_id: String,
    events: mpsc::UnboundedSender<WorkEvent>,
}

/// A Gearman client: submits jobs, receives their work events, and answers
/// status queries.
///
/// All state lives in a per-connection actor task; this handle is cheap and
/// all of its methods serialize through that task. Reading from the server
/// is gated on pending work: a client with no outstanding requests and no
/// live foreground tasks consumes no bytes from the socket.
///
/// # Examples
///
/// Submit a job and wait for its result:
///
/// ```no_run
/// # tokio_test::block_on(async {
/// use gearman::Client;
///
/// let c = Client::connect(("127.0.0.1", gearman::DEFAULT_PORT)).await.unwrap();
/// let task = c.submit("reverse", "hello world").await.unwrap();
/// let result = task.wait_result().await.unwrap();
/// println!("{:?}", result);
/// # });
/// ```
#[derive(Debug)]
pub struct Client {
    ops: mpsc::UnboundedSender<ClientOp>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
    /// Connect to a Gearman server.
    ///
    /// Dials `addr`, then validates the connection with an echo ping. The
    /// two failure modes are distinguishable: [`Connect::Dial`] when the
    /// server cannot be reached, [`Connect::Ping`] when it can but the
    /// ping fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Client, Error> {
        let stream = TcpStream::connect(addr).await.map_err(Connect::Dial)?;
        Client::connect_with(stream).await
    }

    /// Connect over an already-established stream.
    ///
    /// Performs the same initial ping as [`Client::connect`].
    pub async fn connect_with<S>(stream: S) -> Result<Client, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(ClientActor::new(Connection::new(stream), ops_rx, events_tx).run());

        let client = Client {
            ops: ops_tx,
            events: events_rx,
        };
        client
            .ping()
            .await
            .map_err(|e| Connect::Ping(Box::new(e)))?;
        Ok(client)
    }

    /// Submit a foreground job at normal priority with a generated unique
    /// id.
    pub async fn submit(
        &self,
        function: impl Into<String>,
        workload: impl Into<Bytes>,
    ) -> Result<Task, Error> {
        self.submit_with(function, workload, Priority::Normal, "")
            .await
    }

    /// Submit a foreground job.
    ///
    /// An empty `unique_id` is replaced with a fresh UUIDv4. At most one
    /// foreground task per `(function, unique_id)` pair may be in flight on
    /// this client; a duplicate is rejected with [`Error::DuplicateJob`]
    /// before anything is sent.
    pub async fn submit_with(
        &self,
        function: impl Into<String>,
        workload: impl Into<Bytes>,
        priority: Priority,
        unique_id: impl Into<String>,
    ) -> Result<Task, Error> {
        self.submit_inner(function.into(), workload.into(), priority, unique_id.into(), false)
            .await
    }

    /// Submit a background job.
    ///
    /// The returned [`Task`] carries the server-assigned handle but never
    /// receives work events; the server does not relay them for background
    /// jobs. No local uniqueness is enforced (the server coalesces
    /// duplicates on its side).
    pub async fn submit_background(
        &self,
        function: impl Into<String>,
        workload: impl Into<Bytes>,
        priority: Priority,
        unique_id: impl Into<String>,
    ) -> Result<Task, Error> {
        self.submit_inner(function.into(), workload.into(), priority, unique_id.into(), true)
            .await
    }

    async fn submit_inner(
        &self,
        function: String,
        workload: Bytes,
        priority: Priority,
        unique_id: String,
        background: bool,
    ) -> Result<Task, Error> {
        let unique_id = if unique_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            unique_id
        };
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(ClientOp::Submit {
                function,
                workload,
                priority,
                unique_id,
                background,
                resp: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Enable a connection option on the server.
    ///
    /// The only recognized option is `exceptions`, which asks the server to
    /// relay WORK_EXCEPTION frames to this client; anything else fails with
    /// [`Error::UnsupportedOption`] without touching the wire.
    pub async fn set_option(&self, option: &str) -> Result<(), Error> {
        if option != OPTION_EXCEPTIONS {
            return Err(Error::UnsupportedOption(option.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(ClientOp::SetOption {
                option: option.to_string(),
                resp: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Ask the server for the status of a job by handle.
    ///
    /// If the handle belongs to a live task of this client, the task also
    /// receives the answer as a [`WorkEvent::Status`].
    pub async fn get_status(&self, handle: impl Into<String>) -> Result<JobStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(ClientOp::GetStatus {
                handle: handle.into(),
                resp: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Verify the connection with an echo round-trip.
    pub async fn ping(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(ClientOp::Ping { resp: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Stop tracking a task.
    ///
    /// Local only: the foreground protocol has no server-side cancel, so
    /// the server may still run the job to completion. The task's event
    /// stream ends and its `(function, unique_id)` pair becomes available
    /// for resubmission.
    pub fn cancel(&self, task: &Task) {
        let _ = self.ops.send(ClientOp::Cancel {
            handle: task.handle().to_string(),
        });
    }

    /// Wait until this client has no in-flight requests and no live
    /// foreground tasks.
    ///
    /// Resolves immediately if already idle, and always resolves once the
    /// connection closes.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(ClientOp::Wait { resp: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// The next lifecycle event, if the connection is still alive.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Close the connection, cancelling all outstanding work.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(ClientOp::Close { resp: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct ClientActor<S> {
    conn: Connection<S>,
    ops: mpsc::UnboundedReceiver<ClientOp>,
    events: mpsc::UnboundedSender<ClientEvent>,
    rpcs: RpcQueue<ClientRpc>,
    tasks: FnvHashMap<String, TaskEntry>,
    unique: FnvHashSet<(String, String)>,
    waiters: Vec<oneshot::Sender<()>>,
    close_ack: Option<oneshot::Sender<()>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> ClientActor<S> {
    fn new(
        conn: Connection<S>,
        ops: mpsc::UnboundedReceiver<ClientOp>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> ClientActor<S> {
        ClientActor {
            conn,
            ops,
            events,
            rpcs: RpcQueue::new(),
            tasks: FnvHashMap::default(),
            unique: FnvHashSet::default(),
            waiters: Vec::new(),
            close_ack: None,
        }
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        self.shutdown(outcome.err());
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            self.run_gate();
            let reading = self.has_pending();
            tokio::select! {
                biased;
                op = self.ops.recv() => match op {
                    None => return Ok(()),
                    Some(ClientOp::Close { resp }) => {
                        self.close_ack = Some(resp);
                        return Ok(());
                    }
                    Some(op) => self.handle_op(op).await?,
                },
                command = self.conn.read_command(), if reading => {
                    self.handle_command(command?)?;
                }
            }
        }
    }

    /// Pending work: an in-flight RPC or a live foreground task. The read
    /// side is consumed iff this holds.
    fn has_pending(&self) -> bool {
        !self.rpcs.is_empty() || !self.tasks.is_empty()
    }

    /// Resolve parked drain waiters at the transition to idle.
    fn run_gate(&mut self) {
        if !self.has_pending() {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_op(&mut self, op: ClientOp) -> Result<(), Error> {
        match op {
            ClientOp::Submit {
                function,
                workload,
                priority,
                unique_id,
                background,
                resp,
            } => {
                if !background {
                    let key = (function.clone(), unique_id.clone());
                    if self.unique.contains(&key) {
                        let _ = resp.send(Err(Error::DuplicateJob {
                            function,
                            unique_id,
                        }));
                        return Ok(());
                    }
                    self.unique.insert(key);
                }

                let command = Command::request(
                    priority.submit_kind(background),
                    [
                        ("function_name", Bytes::copy_from_slice(function.as_bytes())),
                        ("unique_id", Bytes::copy_from_slice(unique_id.as_bytes())),
                        ("data", workload.clone()),
                    ],
                );
                let command = match command {
                    Ok(command) => command,
                    Err(e) => {
                        if !background {
                            self.unique.remove(&(function, unique_id));
                        }
                        let _ = resp.send(Err(e));
                        return Ok(());
                    }
                };

                self.conn.send(&command).await?;
                self.rpcs.push(ClientRpc::Submit {
                    function,
                    workload,
                    priority,
                    unique_id,
                    background,
                    resp,
                });
            }
            ClientOp::SetOption { option, resp } => {
                let command = Command::request(
                    CommandType::OptionReq,
                    [("option", Bytes::copy_from_slice(option.as_bytes()))],
                );
                match command {
                    Ok(command) => {
                        self.conn.send(&command).await?;
                        self.rpcs.push(ClientRpc::Option { option, resp });
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            ClientOp::GetStatus { handle, resp } => {
                let command = Command::request(
                    CommandType::GetStatus,
                    [("handle", Bytes::copy_from_slice(handle.as_bytes()))],
                );
                match command {
                    Ok(command) => {
                        self.conn.send(&command).await?;
                        self.rpcs.push(ClientRpc::Status { handle, resp });
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            ClientOp::Ping { resp } => {
                let payload = echo_payload();
                let command =
                    Command::request(CommandType::EchoReq, [("data", payload.clone())])?;
                self.conn.send(&command).await?;
                self.rpcs.push(ClientRpc::Echo { payload, resp });
            }
            ClientOp::Wait { resp } => {
                if self.has_pending() {
                    self.waiters.push(resp);
                } else {
                    let _ = resp.send(());
                }
            }
            ClientOp::Cancel { handle } => {
                self.unregister_handle(&handle);
            }
            ClientOp::Close { resp } => {
                self.close_ack = Some(resp);
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        match command.kind() {
            CommandType::Error => self.on_server_error(&command),
            CommandType::JobCreated
            | CommandType::EchoRes
            | CommandType::OptionRes
            | CommandType::StatusRes => {
                let rpc = self.rpcs.take_head(command.name())?;
                self.resolve(rpc, command)
            }
            CommandType::WorkComplete
            | CommandType::WorkFail
            | CommandType::WorkException
            | CommandType::WorkData
            | CommandType::WorkWarning
            | CommandType::WorkStatus => self.on_work_event(command),
            other => {
                tracing::warn!(command = other.name(), "ignoring command meant for a worker");
                Ok(())
            }
        }
    }

    fn resolve(&mut self, rpc: ClientRpc, command: Command) -> Result<(), Error> {
        match rpc {
            ClientRpc::Echo { payload, resp } => {
                let received = command.arg("data").cloned().unwrap_or_default();
                if received != payload {
                    let mismatch = || Protocol::ResponseMismatch {
                        command: "ECHO_RES",
                        sent: format!("{payload:?}"),
                        received: format!("{received:?}"),
                    };
                    let _ = resp.send(Err(mismatch().into()));
                    return Err(mismatch().into());
                }
                let _ = resp.send(Ok(()));
                Ok(())
            }
            ClientRpc::Submit {
                function,
                workload,
                priority,
                unique_id,
                background,
                resp,
            } => {
                let handle = command.arg_str("handle")?.to_string();

                let (events_tx, events_rx) = mpsc::unbounded_channel();
                if background {
                    // background jobs never receive work events
                    drop(events_tx);
                    let task =
                        Task::new(function, workload, handle, priority, unique_id, events_rx);
                    let _ = resp.send(Ok(task));
                    return Ok(());
                }

                let task = Task::new(
                    function.clone(),
                    workload,
                    handle.clone(),
                    priority,
                    unique_id.clone(),
                    events_rx,
                );
                if self
                    .tasks
                    .insert(
                        handle.clone(),
                        TaskEntry {
                            function,
                            unique_id,
                            events: events_tx,
                        },
                    )
                    .is_some()
                {
                    tracing::warn!(%handle, "server reused a live handle; replacing older task");
                }
                self.emit(ClientEvent::Submitted {
                    handle: handle.clone(),
                });
                if resp.send(Ok(task)).is_err() {
                    // the submitter gave up before learning the handle
                    self.unregister_handle(&handle);
                }
                Ok(())
            }
            ClientRpc::Option { option, resp } => {
                let received = command.arg_str("option")?.to_string();
                if received != option {
                    let mismatch = || Protocol::ResponseMismatch {
                        command: "OPTION_RES",
                        sent: option.clone(),
                        received: received.clone(),
                    };
                    let _ = resp.send(Err(mismatch().into()));
                    return Err(mismatch().into());
                }
                self.emit(ClientEvent::Option { option: received });
                let _ = resp.send(Ok(()));
                Ok(())
            }
            ClientRpc::Status { handle, resp } => {
                let received = command.arg_str("handle")?.to_string();
                if received != handle {
                    let mismatch = || Protocol::ResponseMismatch {
                        command: "STATUS_RES",
                        sent: handle.clone(),
                        received: received.clone(),
                    };
                    let _ = resp.send(Err(mismatch().into()));
                    return Err(mismatch().into());
                }
                let status = JobStatus {
                    handle: received,
                    known: command.arg_str("known")? == "1",
                    running: command.arg_str("running")? == "1",
                    numerator: command.arg_u64("numerator")?,
                    denominator: command.arg_u64("denominator")?,
                };
                if let Some(entry) = self.tasks.get(&status.handle) {
                    let _ = entry.events.send(WorkEvent::Status {
                        numerator: status.numerator,
                        denominator: status.denominator,
                        known: status.known,
                        running: status.running,
                    });
                }
                self.emit(ClientEvent::Status(status.clone()));
                let _ = resp.send(Ok(status));
                Ok(())
            }
        }
    }

    fn on_server_error(&mut self, command: &Command) -> Result<(), Error> {
        let code = command.arg_str("code")?.to_string();
        let text = command.arg_str("text")?.to_string();
        tracing::warn!(%code, %text, "server reported an error");

        if let Some(rpc) = self.rpcs.pop_front() {
            self.fail_rpc(
                rpc,
                Protocol::Server {
                    code: code.clone(),
                    text: text.clone(),
                }
                .into(),
            );
        }
        self.emit(ClientEvent::Error(Protocol::Server { code, text }.into()));
        Ok(())
    }

    fn on_work_event(&mut self, command: Command) -> Result<(), Error> {
        let handle = command.arg_str("handle")?.to_string();
        let data = || command.arg("data").cloned().unwrap_or_default();
        let event = match command.kind() {
            CommandType::WorkComplete => WorkEvent::Complete(data()),
            CommandType::WorkFail => WorkEvent::Fail,
            // relayed to the task even if the exceptions option was never
            // set; the server is trusted not to send these unsolicited
            CommandType::WorkException => WorkEvent::Exception(data()),
            CommandType::WorkData => WorkEvent::Data(data()),
            CommandType::WorkWarning => WorkEvent::Warning(data()),
            CommandType::WorkStatus => WorkEvent::Status {
                numerator: command.arg_u64("numerator")?,
                denominator: command.arg_u64("denominator")?,
                known: true,
                running: true,
            },
            _ => unreachable!("handle_command routes only WORK_* here"),
        };

        if event.is_terminal() {
            match self.tasks.remove(&handle) {
                Some(entry) => {
                    self.unique.remove(&(entry.function, entry.unique_id));
                    let _ = entry.events.send(event);
                }
                None => self.emit(ClientEvent::UnknownHandle {
                    handle,
                    command: command.name(),
                }),
            }
        } else {
            match self.tasks.get(&handle) {
                Some(entry) => {
                    let _ = entry.events.send(event);
                }
                None => self.emit(ClientEvent::UnknownHandle {
                    handle,
                    command: command.name(),
                }),
            }
        }
        Ok(())
    }

    /// Drop a task and release its uniqueness reservation.
    fn unregister_handle(&mut self, handle: &str) {
        if let Some(entry) = self.tasks.remove(handle) {
            self.unique.remove(&(entry.function, entry.unique_id));
        }
    }

    /// Reject an RPC, rolling back any uniqueness reservation a foreground
    /// submit took out when it was sent.
    fn fail_rpc(&mut self, rpc: ClientRpc, error: Error) {
        match rpc {
            ClientRpc::Submit {
                function,
                unique_id,
                background: false,
                resp,
                ..
            } => {
                self.unique.remove(&(function, unique_id));
                let _ = resp.send(Err(error));
            }
            other => other.reject(error),
        }
    }

    fn shutdown(mut self, error: Option<Error>) {
        // a protocol violation rejects outstanding requests as such;
        // everything else reads as a plain connection loss
        let cause = match &error {
            Some(Error::Protocol(p)) => Some(p.clone()),
            _ => None,
        };
        if let Some(error) = error {
            tracing::debug!(%error, "client connection terminating");
            self.emit(ClientEvent::Error(error));
        }

        let mut rpcs = std::mem::replace(&mut self.rpcs, RpcQueue::new());
        while let Some(rpc) = rpcs.pop_front() {
            let reason = cause
                .clone()
                .map(Error::Protocol)
                .unwrap_or(Error::ConnectionClosed);
            self.fail_rpc(rpc, reason);
        }
        for (_, entry) in self.tasks.drain() {
            let _ = entry
                .events
                .send(WorkEvent::Exception(Bytes::from_static(b"Lost connection")));
        }
        self.unique.clear();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.emit(ClientEvent::Closed);
        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(());
        }
    }
}
