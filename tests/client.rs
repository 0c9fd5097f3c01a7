mod mock;

use gearman::{
    Client, ClientEvent, CommandType, Error, Priority, Protocol, TaskFailure, WorkEvent,
};
use mock::MockServer;

async fn connected() -> (Client, MockServer) {
    let (io, mut server) = MockServer::pair();
    let (client, ()) = tokio::join!(Client::connect_with(io), server.handshake());
    (client.unwrap(), server)
}

#[tokio::test]
async fn connect_pings_before_resolving() {
    let (io, mut server) = MockServer::pair();
    let serve = async {
        let echo = server.expect(CommandType::EchoReq).await;
        // the ping payload must be echoed back verbatim
        server.echo_back(&echo).await;
    };
    let (client, ()) = tokio::join!(Client::connect_with(io), serve);
    client.unwrap();
}

#[tokio::test]
async fn connect_fails_distinguishably_on_bad_ping() {
    let (io, mut server) = MockServer::pair();
    let serve = async {
        server.expect(CommandType::EchoReq).await;
        server
            .send(
                &gearman::Command::response(
                    CommandType::EchoRes,
                    [("data", bytes::Bytes::from_static(b"not-the-payload"))],
                )
                .unwrap(),
            )
            .await;
    };
    let (client, ()) = tokio::join!(Client::connect_with(io), serve);
    assert!(matches!(
        client.unwrap_err(),
        Error::Connect(gearman::Connect::Ping(_))
    ));
}

#[tokio::test]
async fn submit_delivers_task_and_relays_events_in_order() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        let submit = server.expect(CommandType::SubmitJob).await;
        assert_eq!(submit.arg_str("function_name").unwrap(), "q1");
        // no unique id given, so one was generated
        assert!(!submit.arg_str("unique_id").unwrap().is_empty());
        assert_eq!(&submit.arg("data").unwrap()[..], b"TestData");
        server.send(&mock::job_created("H:lap:1")).await;
    };
    let (task, ()) = tokio::join!(client.submit("q1", "TestData"), serve);
    let mut task = task.unwrap();
    assert_eq!(task.handle(), "H:lap:1");
    assert_eq!(task.function(), "q1");

    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Submitted { ref handle }) if handle == "H:lap:1"
    ));

    server.send(&mock::work_data("H:lap:1", "x")).await;
    server.send(&mock::work_status("H:lap:1", 5, 10)).await;
    server.send(&mock::work_complete("H:lap:1", "y")).await;

    assert_eq!(task.next_event().await, Some(WorkEvent::Data("x".into())));
    assert_eq!(
        task.next_event().await,
        Some(WorkEvent::Status {
            numerator: 5,
            denominator: 10,
            known: true,
            running: true
        })
    );
    assert_eq!(task.next_event().await, Some(WorkEvent::Complete("y".into())));
    assert_eq!(task.next_event().await, None);

    // terminal event drained the client
    client.wait().await;
}

#[tokio::test]
async fn duplicate_unique_rejects_without_touching_the_wire() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:dup:1")).await;
    };
    let (first, ()) = tokio::join!(
        client.submit_with("q3", "A", Priority::Normal, "u1"),
        serve
    );
    let first = first.unwrap();

    let err = client
        .submit_with("q3", "A2", Priority::Normal, "u1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DuplicateJob { ref function, ref unique_id }
            if function == "q3" && unique_id == "u1"
    ));
    server.expect_silence().await;

    // once the first task ends, the pair is free again
    server.send(&mock::work_complete("H:dup:1", "done")).await;
    assert_eq!(&first.wait_result().await.unwrap()[..], b"done");

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:dup:2")).await;
    };
    let (third, ()) = tokio::join!(
        client.submit_with("q3", "A3", Priority::Normal, "u1"),
        serve
    );
    third.unwrap();
}

#[tokio::test]
async fn priorities_pick_the_matching_submit_variant() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJobHigh).await;
        server.send(&mock::job_created("H:p:1")).await;
        server.expect(CommandType::SubmitJobLow).await;
        server.send(&mock::job_created("H:p:2")).await;
        server.expect(CommandType::SubmitJobHighBg).await;
        server.send(&mock::job_created("H:p:3")).await;
    };
    let (high, low, bg, ()) = tokio::join!(
        client.submit_with("q4", "H", Priority::High, "pH"),
        client.submit_with("q4", "L", Priority::Low, "pL"),
        client.submit_background("q4", "B", Priority::High, "pB"),
        serve
    );
    assert_eq!(high.unwrap().handle(), "H:p:1");
    assert_eq!(low.unwrap().handle(), "H:p:2");
    assert_eq!(bg.unwrap().handle(), "H:p:3");
}

#[tokio::test]
async fn background_tasks_stay_outside_the_gate() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        let submit = server.expect(CommandType::SubmitJobBg).await;
        assert_eq!(submit.arg_str("function_name").unwrap(), "q2");
        server.send(&mock::job_created("H:bg:1")).await;
    };
    let (task, ()) = tokio::join!(
        client.submit_background("q2", "TestData", Priority::Normal, ""),
        serve
    );
    let mut task = task.unwrap();
    assert_eq!(task.handle(), "H:bg:1");

    // not tracked: the client is already idle
    client.wait().await;

    // a frame pushed while the client is idle sits unread until an rpc
    // resumes the read side; it then routes as unknown-handle
    server.send(&mock::work_complete("H:bg:1", "r")).await;
    let serve = async {
        let echo = server.expect(CommandType::EchoReq).await;
        server.echo_back(&echo).await;
    };
    let (ping, ()) = tokio::join!(client.ping(), serve);
    ping.unwrap();

    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::UnknownHandle { ref handle, command: "WORK_COMPLETE" })
            if handle == "H:bg:1"
    ));
    assert_eq!(task.next_event().await, None);
}

#[tokio::test]
async fn set_option_round_trips_and_rejects_unknown_options() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        let req = server.expect(CommandType::OptionReq).await;
        assert_eq!(req.arg_str("option").unwrap(), "exceptions");
        server.send(&mock::option_res("exceptions")).await;
    };
    let (res, ()) = tokio::join!(client.set_option("exceptions"), serve);
    res.unwrap();
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Option { ref option }) if option == "exceptions"
    ));

    // unsupported options fail client-side, before any bytes
    assert!(matches!(
        client.set_option("forward").await.unwrap_err(),
        Error::UnsupportedOption(ref o) if o == "forward"
    ));
    server.expect_silence().await;
}

#[tokio::test]
async fn option_mismatch_is_fatal() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::OptionReq).await;
        server.send(&mock::option_res("something-else")).await;
    };
    let (res, ()) = tokio::join!(client.set_option("exceptions"), serve);
    assert!(matches!(
        res.unwrap_err(),
        Error::Protocol(Protocol::ResponseMismatch { command: "OPTION_RES", .. })
    ));
    // the connection died with it
    assert!(matches!(
        client.ping().await.unwrap_err(),
        Error::ConnectionClosed
    ));
}

#[tokio::test]
async fn get_status_verifies_the_handle_and_mirrors_to_the_task() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:s:1")).await;
    };
    let (task, ()) = tokio::join!(client.submit("q5", "w"), serve);
    let mut task = task.unwrap();

    let serve = async {
        let req = server.expect(CommandType::GetStatus).await;
        assert_eq!(req.arg_str("handle").unwrap(), "H:s:1");
        server.send(&mock::status_res("H:s:1", true, true, 3, 10)).await;
    };
    let (status, ()) = tokio::join!(client.get_status("H:s:1"), serve);
    let status = status.unwrap();
    assert!(status.known);
    assert!(status.running);
    assert_eq!((status.numerator, status.denominator), (3, 10));

    // the tracked task saw the same answer
    assert_eq!(
        task.next_event().await,
        Some(WorkEvent::Status {
            numerator: 3,
            denominator: 10,
            known: true,
            running: true
        })
    );
    // and the client mirrored it as an event (after the Submitted one)
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Submitted { .. })
    ));
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Status(ref s)) if s.handle == "H:s:1"
    ));
}

#[tokio::test]
async fn status_handle_mismatch_is_fatal() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::GetStatus).await;
        server.send(&mock::status_res("H:other:9", false, false, 0, 0)).await;
    };
    let (status, ()) = tokio::join!(client.get_status("H:mine:9"), serve);
    assert!(matches!(
        status.unwrap_err(),
        Error::Protocol(Protocol::ResponseMismatch { command: "STATUS_RES", .. })
    ));
}

#[tokio::test]
async fn server_error_rejects_only_the_correlated_request() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::server_error("ERR_QUEUE", "queue is full")).await;
    };
    let (res, ()) = tokio::join!(
        client.submit_with("q6", "w", Priority::Normal, "ue"),
        serve
    );
    assert!(matches!(
        res.unwrap_err(),
        Error::Protocol(Protocol::Server { ref code, .. }) if code == "ERR_QUEUE"
    ));
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Error(Error::Protocol(Protocol::Server { .. })))
    ));

    // non-fatal: the connection still answers
    let serve = async {
        let echo = server.expect(CommandType::EchoReq).await;
        server.echo_back(&echo).await;
    };
    let (ping, ()) = tokio::join!(client.ping(), serve);
    ping.unwrap();

    // the rejected submit released its uniqueness reservation
    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:e:2")).await;
    };
    let (retry, ()) = tokio::join!(
        client.submit_with("q6", "w", Priority::Normal, "ue"),
        serve
    );
    retry.unwrap();
}

#[tokio::test]
async fn responses_resolve_in_submission_order() {
    let (client, mut server) = connected().await;

    let serve = async {
        let first = server.expect(CommandType::SubmitJob).await;
        assert_eq!(first.arg_str("unique_id").unwrap(), "a");
        let second = server.expect(CommandType::SubmitJob).await;
        assert_eq!(second.arg_str("unique_id").unwrap(), "b");
        server.send(&mock::job_created("H:f:1")).await;
        server.send(&mock::job_created("H:f:2")).await;
    };
    let (t1, t2, ()) = tokio::join!(
        client.submit_with("q7", "1", Priority::Normal, "a"),
        client.submit_with("q7", "2", Priority::Normal, "b"),
        serve
    );
    assert_eq!(t1.unwrap().handle(), "H:f:1");
    assert_eq!(t2.unwrap().handle(), "H:f:2");
}

#[tokio::test]
async fn out_of_order_response_kills_the_connection() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        // STATUS_RES while JOB_CREATED is owed
        server.send(&mock::status_res("H:x:1", true, true, 0, 1)).await;
    };
    let (res, ()) = tokio::join!(client.submit("q8", "w"), serve);
    assert!(matches!(
        res.unwrap_err(),
        Error::Protocol(Protocol::UnexpectedResponse {
            expected: "JOB_CREATED",
            received: "STATUS_RES",
        })
    ));
}

#[tokio::test]
async fn cancel_releases_the_unique_pair_and_ends_the_stream() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:c:1")).await;
    };
    let (task, ()) = tokio::join!(
        client.submit_with("q9", "w", Priority::Normal, "uc"),
        serve
    );
    let mut task = task.unwrap();

    client.cancel(&task);
    assert_eq!(task.next_event().await, None);
    client.wait().await;

    // no wire traffic for a local cancel
    server.expect_silence().await;

    // the pair is reusable
    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:c:2")).await;
    };
    let (again, ()) = tokio::join!(
        client.submit_with("q9", "w2", Priority::Normal, "uc"),
        serve
    );
    again.unwrap();
}

#[tokio::test]
async fn wait_parks_until_the_last_task_ends() {
    let (client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:w:1")).await;
    };
    let (task, ()) = tokio::join!(client.submit("q10", "w"), serve);
    let task = task.unwrap();

    let (_, ()) = tokio::join!(client.wait(), async {
        server.send(&mock::work_fail("H:w:1")).await;
    });
    assert_eq!(task.wait_result().await.unwrap_err(), TaskFailure::Failed);
}

#[tokio::test]
async fn lost_connection_finalizes_everything() {
    let (mut client, mut server) = connected().await;

    let serve = async {
        server.expect(CommandType::SubmitJob).await;
        server.send(&mock::job_created("H:l:1")).await;
    };
    let (task, ()) = tokio::join!(client.submit("q11", "w"), serve);
    let mut task = task.unwrap();

    drop(server);

    assert_eq!(
        task.next_event().await,
        Some(WorkEvent::Exception("Lost connection".into()))
    );
    assert_eq!(task.next_event().await, None);
    client.wait().await;
    assert!(matches!(
        client.ping().await.unwrap_err(),
        Error::ConnectionClosed
    ));

    // Submitted, then the close diagnostics
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Submitted { .. })
    ));
    assert!(matches!(
        client.next_event().await,
        Some(ClientEvent::Error(Error::ConnectionClosed))
    ));
    assert!(matches!(client.next_event().await, Some(ClientEvent::Closed)));
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn close_tears_down_cleanly() {
    let (client, mut server) = connected().await;
    client.close().await;
    // the far side observes EOF
    let mut buf = [0u8; 8];
    use tokio::io::AsyncReadExt;
    assert_eq!(server_stream(&mut server).read(&mut buf).await.unwrap(), 0);
}

// close_tears_down_cleanly needs the raw stream; everything else goes
// through the frame helpers
fn server_stream(server: &mut MockServer) -> &mut tokio::io::DuplexStream {
    server.stream_mut()
}
