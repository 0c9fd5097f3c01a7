//! End-to-end scenarios against a live gearmand.
//!
//! Set `GEARMAN_URL` (e.g. `127.0.0.1:4730`) to run these; they are skipped
//! otherwise.

use std::io;

use gearman::{Client, Priority, TaskFailure, WorkEvent, Worker};
use tokio::sync::mpsc;

macro_rules! skip_check {
    () => {
        if std::env::var_os("GEARMAN_URL").is_none() {
            return;
        }
        let _ = tracing_subscriber::fmt::try_init();
    };
}

fn addr() -> String {
    std::env::var("GEARMAN_URL").unwrap_or_else(|_| "127.0.0.1:4730".to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_and_work() {
    skip_check!();

    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q1", |job| async move {
            job.complete(job.workload().clone()).ok();
            Ok::<(), io::Error>(())
        })
        .await
        .unwrap();

    let client = Client::connect(addr()).await.unwrap();
    let task = client.submit("q1", "TestData").await.unwrap();
    assert!(!task.handle().is_empty());
    assert_eq!(&task.wait_result().await.unwrap()[..], b"TestData");

    // both sides drain back to idle
    client.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn background_job_reaches_a_worker_but_not_the_client() {
    skip_check!();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q2", move |job| {
            let seen = seen_tx.clone();
            async move {
                seen.send(job.workload().clone()).unwrap();
                job.complete("").ok();
                Ok::<(), io::Error>(())
            }
        })
        .await
        .unwrap();

    let client = Client::connect(addr()).await.unwrap();
    let mut task = client
        .submit_background("q2", "TestData", Priority::Normal, "")
        .await
        .unwrap();
    assert!(!task.handle().is_empty());

    // the worker runs it
    assert_eq!(&seen_rx.recv().await.unwrap()[..], b"TestData");
    // ...but the submitter sees no events and is already idle
    client.wait().await;
    assert_eq!(task.next_event().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_unique_ids_are_rejected_until_the_first_finishes() {
    skip_check!();

    let client = Client::connect(addr()).await.unwrap();
    let first = client
        .submit_with("q3", "A", Priority::Normal, "u1")
        .await
        .unwrap();

    client
        .submit_with("q3", "A2", Priority::Normal, "u1")
        .await
        .unwrap_err();

    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q3", |job| async move {
            job.complete("ok").ok();
            Ok::<(), io::Error>(())
        })
        .await
        .unwrap();

    first.wait_result().await.unwrap();

    // the pair is free again
    let third = client
        .submit_with("q3", "A3", Priority::Normal, "u1")
        .await
        .unwrap();
    third.wait_result().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn high_priority_jobs_run_first() {
    skip_check!();

    let client = Client::connect(addr()).await.unwrap();
    // queue both before any worker exists, so the server orders them
    let low = client
        .submit_with("q4", "L", Priority::Low, "pL")
        .await
        .unwrap();
    let high = client
        .submit_with("q4", "H", Priority::High, "pH")
        .await
        .unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q4", move |job| {
            let order = order_tx.clone();
            async move {
                order.send(job.workload().clone()).unwrap();
                job.complete("").ok();
                Ok::<(), io::Error>(())
            }
        })
        .await
        .unwrap();

    low.wait_result().await.unwrap();
    high.wait_result().await.unwrap();

    assert_eq!(&order_rx.recv().await.unwrap()[..], b"H");
    assert_eq!(&order_rx.recv().await.unwrap()[..], b"L");
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_data_arrives_before_completion() {
    skip_check!();

    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q5", |job| async move {
            job.send_data("x").unwrap();
            job.complete("y").unwrap();
            Ok::<(), io::Error>(())
        })
        .await
        .unwrap();

    let client = Client::connect(addr()).await.unwrap();
    let mut task = client.submit("q5", "w").await.unwrap();

    assert_eq!(task.next_event().await, Some(WorkEvent::Data("x".into())));
    assert_eq!(task.next_event().await, Some(WorkEvent::Complete("y".into())));
    assert_eq!(task.next_event().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn exceptions_are_relayed_only_with_the_option() {
    skip_check!();

    let worker = Worker::connect(addr()).await.unwrap();
    worker
        .register_fn("q6", |job| async move {
            job.exception("Reason").unwrap();
            Ok::<(), io::Error>(())
        })
        .await
        .unwrap();

    // with the option: the exception payload comes through
    let with_option = Client::connect(addr()).await.unwrap();
    with_option.set_option("exceptions").await.unwrap();
    let task = with_option.submit("q6", "w").await.unwrap();
    assert_eq!(
        task.wait_result().await.unwrap_err(),
        TaskFailure::Exception("Reason".into())
    );

    // without it: the same worker behavior reads as a bare failure
    let plain = Client::connect(addr()).await.unwrap();
    let task = plain.submit("q6", "w").await.unwrap();
    assert_eq!(task.wait_result().await.unwrap_err(), TaskFailure::Failed);
}
