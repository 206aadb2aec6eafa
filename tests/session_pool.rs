use remote_shelf::ssh::fake::{FakeConnector, FakeFailure};
use remote_shelf::ssh::{
    AuthMaterial, CommandRequest, ConnectionTarget, RemoteSession, SessionOptions, SessionPool, SessionState,
};
use remote_shelf::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn target(host: &str) -> ConnectionTarget {
    ConnectionTarget::new(host, 22, "deploy", AuthMaterial::Password("hunter2".into())).unwrap()
}

fn options() -> SessionOptions {
    SessionOptions {
        connect_timeout: Duration::from_secs(2),
        transfer_timeout: Duration::from_secs(2),
        max_reconnect_attempts: 3,
    }
}

fn request(command: &str) -> CommandRequest {
    CommandRequest::new(command, Duration::from_secs(5))
}

#[tokio::test]
async fn commands_run_in_submission_order() {
    let fake = FakeConnector::new();
    fake.respond("sleep 1", 0, &[], &[]);
    fake.stall_once("sleep 1", Duration::from_millis(300));
    for i in 0..4 {
        fake.respond(&format!("echo {}", i), 0, &[&i.to_string()], &[]);
    }
    let session = Arc::new(RemoteSession::new(target("fifo.local"), Arc::new(fake.clone()), options()));
    session.connect().await.unwrap();

    let mut handles = Vec::new();
    let first = Arc::clone(&session);
    handles.push(tokio::spawn(async move { first.execute(request("sleep 1")).await }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..4 {
        let s = Arc::clone(&session);
        handles.push(tokio::spawn(async move { s.execute(request(&format!("echo {}", i))).await }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap().unwrap().stdout);
    }

    assert_eq!(
        fake.executed(),
        vec!["sleep 1", "echo 0", "echo 1", "echo 2", "echo 3"]
    );
    assert_eq!(outputs[1..], [vec!["0"], vec!["1"], vec!["2"], vec!["3"]]);
}

#[tokio::test]
async fn timeout_fails_session_and_next_call_reconnects_once() {
    let fake = FakeConnector::new();
    fake.respond("du -sh /var", 0, &["1.2G\t/var"], &[]);
    fake.stall_once("du -sh /var", Duration::from_millis(500));
    let session = RemoteSession::new(target("slow.local"), Arc::new(fake.clone()), options());

    let short = CommandRequest::new("du -sh /var", Duration::from_millis(100));
    let err = session.execute(short).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout { .. }));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.connect_attempts(), 1);

    let result = session.execute(request("du -sh /var")).await.unwrap();
    assert_eq!(result.stdout, vec!["1.2G\t/var"]);
    assert_eq!(session.connect_attempts(), 2);
    assert_eq!(fake.connect_count(), 2);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn queued_commands_fail_fast_after_failure() {
    let fake = FakeConnector::new();
    fake.respond("first", 0, &[], &[]);
    fake.respond("second", 0, &[], &[]);
    fake.respond("third", 0, &["ok"], &[]);
    fake.stall_once("first", Duration::from_millis(200));
    fake.fail_next_execute(FakeFailure::Transport);

    let session = Arc::new(RemoteSession::new(target("flaky.local"), Arc::new(fake.clone()), options()));
    session.connect().await.unwrap();

    let s = Arc::clone(&session);
    let first = tokio::spawn(async move { s.execute(request("first")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let s = Arc::clone(&session);
    let second = tokio::spawn(async move { s.execute(request("second")).await });

    assert!(first.await.unwrap().unwrap_err().is_transport());
    assert!(second.await.unwrap().unwrap_err().is_transport());
    assert_eq!(fake.connect_count(), 1);
    assert!(!fake.executed().contains(&"second".to_string()));

    // A request submitted after the failure reconnects.
    let third = session.execute(request("third")).await.unwrap();
    assert_eq!(third.stdout, vec!["ok"]);
    assert_eq!(fake.connect_count(), 2);
}

#[tokio::test]
async fn concurrent_acquires_share_one_session() {
    let fake = FakeConnector::new();
    let pool = Arc::new(SessionPool::new(Arc::new(fake.clone()), options()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let session = pool.acquire(&target("shared.local")).await;
            session.connect().await.unwrap();
            session
        }));
    }
    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap());
    }

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(pool.len(), 1);
    assert_eq!(fake.connect_count(), 1);
}

#[tokio::test]
async fn distinct_targets_run_in_parallel() {
    let fake = FakeConnector::new();
    fake.respond("make", 0, &[], &[]);
    fake.stall_once("make", Duration::from_millis(400));
    fake.stall_once("make", Duration::from_millis(400));
    let pool = Arc::new(SessionPool::new(Arc::new(fake.clone()), options()));

    let a = pool.acquire(&target("a.local")).await;
    let b = pool.acquire(&target("b.local")).await;
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    let started = Instant::now();
    let (ra, rb) = tokio::join!(a.execute(request("make")), b.execute(request("make")));
    ra.unwrap();
    rb.unwrap();
    assert!(started.elapsed() < Duration::from_millis(750));
}

#[tokio::test]
async fn released_sessions_are_evicted_and_recreated_on_demand() {
    let fake = FakeConnector::new();
    fake.respond("id -un", 0, &["deploy"], &[]);
    let pool = SessionPool::new(Arc::new(fake.clone()), options());
    let t = target("evict.local");

    let first = pool.acquire(&t).await;
    first.execute(request("id -un")).await.unwrap();
    pool.release(&first);
    assert_eq!(pool.evict_idle(Duration::ZERO).await, 1);
    assert!(first.is_closed());

    let second = pool.acquire(&t).await;
    assert!(!Arc::ptr_eq(&first, &second));
    second.execute(request("id -un")).await.unwrap();
    assert_eq!(fake.connect_count(), 2);
    assert_eq!(pool.list_sessions().len(), 1);
}
