//! Tunnel broker flows: instruction push, worker callback, splice.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use vmfleet_controller::tunnel::{TunnelBroker, TunnelError, WorkerReply};
use vmfleet_model::WatchInstruction;
use vmfleet_tunnel::{Notifier, NotifyError};

#[tokio::test]
async fn resolve_ip_round_trip() {
    let broker = TunnelBroker::new(Notifier::new());
    let caller = CancellationToken::new();

    let (mut watch, _registration) = broker.notifier().register(&caller, "w1");
    let responder = broker.clone();
    tokio::spawn(async move {
        let Some(WatchInstruction::ResolveIp(action)) = watch.recv().await else {
            panic!("expected a resolve-IP instruction");
        };
        assert_eq!(action.vm_uid, "vm-1");
        responder
            .respond_ip(&action.session, WorkerReply::ok("10.0.0.7".into()))
            .unwrap();
    });

    let ip = broker.resolve_ip(&caller, "w1", "vm-1").await.unwrap();
    assert_eq!(ip, "10.0.0.7");
}

#[tokio::test]
async fn port_forward_returns_the_worker_stream() {
    let broker = TunnelBroker::new(Notifier::new());
    let caller = CancellationToken::new();

    let (mut watch, _registration) = broker.notifier().register(&caller, "w1");
    let responder = broker.clone();
    tokio::spawn(async move {
        let Some(WatchInstruction::PortForward(action)) = watch.recv().await else {
            panic!("expected a port-forward instruction");
        };
        assert_eq!(action.port, 8080);

        let (worker_end, api_end) = tokio::io::duplex(64);
        responder
            .respond_connection(&action.session, WorkerReply::ok(Box::new(api_end) as _))
            .unwrap();

        let (mut read, mut write) = tokio::io::split(worker_end);
        let mut buf = [0u8; 5];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        write.write_all(b"world").await.unwrap();
    });

    let mut conn = broker
        .port_forward(&caller, "w1", "vm-1", 8080)
        .await
        .unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
}

#[tokio::test]
async fn worker_side_failure_surfaces_as_error_message() {
    let broker = TunnelBroker::new(Notifier::new());
    let caller = CancellationToken::new();

    let (mut watch, _registration) = broker.notifier().register(&caller, "w1");
    let responder = broker.clone();
    tokio::spawn(async move {
        let Some(WatchInstruction::ResolveIp(action)) = watch.recv().await else {
            panic!("expected a resolve-IP instruction");
        };
        responder
            .respond_ip(&action.session, WorkerReply::error("VM has no IP yet"))
            .unwrap();
    });

    let err = broker.resolve_ip(&caller, "w1", "vm-1").await.unwrap_err();
    match err {
        TunnelError::Worker(message) => assert_eq!(message, "VM has no IP yet"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_worker_fails_after_the_wait_deadline() {
    let broker = TunnelBroker::new(Notifier::with_worker_wait(Duration::from_secs(3)));
    let caller = CancellationToken::new();

    let err = broker.resolve_ip(&caller, "w1", "vm-1").await.unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Notify(NotifyError::NoWorker(_))
    ));
}

#[tokio::test]
async fn cancelled_caller_expires_the_session() {
    let broker = TunnelBroker::new(Notifier::new());
    let caller = CancellationToken::new();

    let registration_caller = CancellationToken::new();
    let (mut watch, _registration) = broker.notifier().register(&registration_caller, "w1");

    let requester = {
        let broker = broker.clone();
        let caller = caller.clone();
        tokio::spawn(async move { broker.resolve_ip(&caller, "w1", "vm-1").await })
    };

    let Some(WatchInstruction::ResolveIp(action)) = watch.recv().await else {
        panic!("expected a resolve-IP instruction");
    };
    caller.cancel();
    let err = requester.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::Rendezvous(_)));

    // The late callback finds no session left.
    assert!(broker
        .respond_ip(&action.session, WorkerReply::ok("10.0.0.7".into()))
        .is_err());
}
