#![cfg(unix)]

use crate::error::CliproxyError;
use crate::lock::SessionLock;
use crate::supervisor::Supervisor;

use super::support::{fixture, write_fake_sidecar};

#[tokio::test]
async fn start_writes_lock_and_stop_removes_it() {
    let fx = fixture();
    let binary = write_fake_sidecar(
        &fx,
        "#!/bin/sh\necho 'starting up'\necho 'PROXY_READY:45871'\nsleep 30\n",
    );
    let supervisor = Supervisor::new(fx.root.clone(), binary);

    let running = supervisor.ensure_running(None).await.unwrap();
    assert!(!running.reused);
    assert_eq!(running.port, 45871);

    let lock = SessionLock::load(&fx.root.session_lock_path()).unwrap();
    assert_eq!(lock.port, 45871);
    assert_eq!(lock.session_count, 1);
    assert_eq!(lock.pid, running.pid);

    supervisor.release_session();
    let lock = SessionLock::load(&fx.root.session_lock_path()).unwrap();
    assert_eq!(lock.session_count, 0);

    let report = supervisor.stop().await.unwrap();
    assert!(report.was_running);
    assert_eq!(report.sessions_at_stop, 0);
    assert!(
        SessionLock::load(&fx.root.session_lock_path()).is_none(),
        "lock never survives a clean stop"
    );

    // Idempotent.
    let report = supervisor.stop().await.unwrap();
    assert!(!report.was_running);
}

#[tokio::test]
async fn early_exit_fails_with_drained_output() {
    let fx = fixture();
    let binary = write_fake_sidecar(&fx, "#!/bin/sh\necho 'bind: permission denied'\nexit 3\n");
    let supervisor = Supervisor::new(fx.root.clone(), binary);

    match supervisor.ensure_running(None).await {
        Err(CliproxyError::ProxyStartFailed { reason }) => {
            assert!(reason.contains("permission denied"), "{reason}");
        }
        other => panic!("expected ProxyStartFailed, got {other:?}"),
    }
    assert!(SessionLock::load(&fx.root.session_lock_path()).is_none());
}

#[tokio::test]
async fn stale_lock_is_recovered() {
    let fx = fixture();
    let binary = write_fake_sidecar(
        &fx,
        "#!/bin/sh\necho 'PROXY_READY:45872'\nsleep 30\n",
    );
    // A lock for a pid that cannot exist.
    SessionLock {
        pid: u32::MAX - 7,
        port: 1,
        started_at: 0,
        session_count: 3,
    }
    .save(&fx.root.session_lock_path())
    .unwrap();

    let supervisor = Supervisor::new(fx.root.clone(), binary);
    let running = supervisor.ensure_running(None).await.unwrap();
    assert!(!running.reused, "stale lock must not be trusted");
    assert_eq!(running.port, 45872);

    let lock = SessionLock::load(&fx.root.session_lock_path()).unwrap();
    assert_eq!(lock.session_count, 1, "fresh lock starts at one session");

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn generated_config_carries_the_port() {
    let fx = fixture();
    let binary = write_fake_sidecar(
        &fx,
        "#!/bin/sh\necho 'PROXY_READY:45873'\nsleep 30\n",
    );
    let supervisor = Supervisor::new(fx.root.clone(), binary);
    supervisor.ensure_running(None).await.unwrap();

    let rendered = std::fs::read_to_string(fx.root.sidecar_config_path()).unwrap();
    assert!(rendered.contains("port:"), "{rendered}");
    assert!(rendered.contains("auth-dir:"), "{rendered}");

    supervisor.stop().await.unwrap();
}
