//! API bindings for Gearman clients and workers.
//!
//! This crate speaks the binary [Gearman](http://gearman.org/) job-server
//! protocol: clients submit named function calls with opaque payloads,
//! workers register for function names and execute queued jobs, and the
//! server routes jobs and relays progress, warnings, completion, failure,
//! and exceptions back to the submitting client.
//!
//! # Submitting jobs
//!
//! If you want to **submit** jobs to Gearman, use [`Client`].
//!
//! ```no_run
//! # tokio_test::block_on(async {
//! use gearman::Client;
//!
//! let c = Client::connect(("127.0.0.1", gearman::DEFAULT_PORT)).await.unwrap();
//! let task = c.submit("reverse", "hello").await.unwrap();
//! println!("queued as {}", task.handle());
//! let result = task.wait_result().await.unwrap();
//! println!("{:?}", result);
//! # });
//! ```
//!
//! # Performing jobs (i.e., workers)
//!
//! If you want to **accept** jobs from Gearman, use [`Worker`].
//!
//! ```no_run
//! # tokio_test::block_on(async {
//! use gearman::Worker;
//! use std::io;
//!
//! let w = Worker::connect(("127.0.0.1", gearman::DEFAULT_PORT)).await.unwrap();
//! w.register_fn("reverse", |job| async move {
//!     let mut out = job.workload().to_vec();
//!     out.reverse();
//!     job.complete(out).ok();
//!     Ok::<(), io::Error>(())
//! })
//! .await
//! .unwrap();
//! # });
//! ```
//!
//! # Backpressure
//!
//! A connection with nothing outstanding stops consuming bytes from the
//! server: the read side only runs while a request is in flight, a
//! foreground task is live, or the worker is grabbing or sleeping. This is
//! observable at the server and part of the protocol contract, not an
//! optimization. [`Client::wait`] parks until the connection reaches that
//! idle state.
#![deny(missing_docs)]

mod client;
mod error;
mod proto;
mod worker;

pub use client::{Client, ClientEvent, JobStatus, Priority, Task, TaskFailure, WorkEvent};
pub use error::{Connect, Error, Protocol};
pub use proto::{Codec, Command, CommandType, Magic, DEFAULT_PORT, HEADER_SIZE};
pub use worker::{Job, JobRunner, Worker, WorkerEvent};
