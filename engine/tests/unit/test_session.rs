//! Session manager tests

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use kubedeck::ssh::executor;
use kubedeck::ssh::mock::MockDialer;
use kubedeck::ssh::pool::{ConnectionPool, PoolOptions};
use kubedeck::ssh::session::{Session, SessionManager, SessionOptions};
use kubedeck::ssh::SshCredential;

use crate::common::{token, TEST_KEY};

fn manager(dialer: &Arc<MockDialer>) -> SessionManager {
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolOptions::default()));
    SessionManager::new(pool, SessionOptions::default())
}

async fn open(manager: &SessionManager) -> Session {
    manager
        .create_session(
            "42",
            "203.0.113.10",
            22,
            "root",
            SshCredential::from_pem(TEST_KEY).unwrap(),
            &token(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_session_lifecycle() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);

    let session = open(&sessions).await;
    assert!(session.is_owned_by(&token()));
    assert!(!session.is_owned_by(&SecretString::from("someone-else".to_string())));
    assert_eq!(session.vps_id, "42");

    let found = sessions.get_session(&session.id).await.unwrap();
    assert!(found.connection().same_transport(session.connection()));

    assert!(sessions.release_session(&session.id).await);
    assert!(!sessions.release_session(&session.id).await);
    assert!(sessions.get_session(&session.id).await.unwrap_err().is_not_found());

    // Releasing keeps the pooled connection
    assert!(sessions.pool().contains("root@203.0.113.10").await);
    assert_eq!(dialer.closed_count(), 0);
}

#[tokio::test]
async fn test_sessions_share_pooled_connection() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);

    let a = open(&sessions).await;
    let b = open(&sessions).await;

    assert_ne!(a.id, b.id);
    assert!(a.connection().same_transport(b.connection()));
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(sessions.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);
    let session = open(&sessions).await;

    tokio::time::advance(Duration::from_secs(14 * 60)).await;
    assert!(sessions.get_session(&session.id).await.is_ok());

    tokio::time::advance(Duration::from_secs(15 * 60)).await;
    assert!(sessions.get_session(&session.id).await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_session_expires_at_max_age_despite_use() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);
    let session = open(&sessions).await;

    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(sessions.get_session(&session.id).await.is_ok());
    }

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    assert!(sessions.get_session(&session.id).await.is_err());
}

#[tokio::test]
async fn test_dead_connection_invalidates_session() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);
    let session = open(&sessions).await;

    dialer.kill_connections();
    assert!(sessions.get_session(&session.id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_expired_and_closes_connection() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);
    open(&sessions).await;
    open(&sessions).await;

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    let fresh = open(&sessions).await;

    // The fresh session still leases the shared connection
    assert_eq!(sessions.sweep_invalid().await, 2);
    assert_eq!(sessions.len().await, 1);
    assert_eq!(dialer.closed_count(), 0);

    sessions.release_session(&fresh.id).await;
    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    let last = open(&sessions).await;
    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    assert_eq!(sessions.sweep_invalid().await, 1);
    assert!(sessions.is_empty().await);
    assert_eq!(dialer.closed_count(), 1);
    assert!(!sessions.pool().contains(last.connection().key()).await);
}

#[tokio::test(start_paused = true)]
async fn test_commands_count_as_session_use() {
    let dialer = Arc::new(MockDialer::new());
    let sessions = manager(&dialer);
    let session = open(&sessions).await;

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(executor::execute(session.connection(), "echo hi").await.success());
    }

    assert_eq!(session.idle_for(), Duration::ZERO);
    assert_eq!(sessions.sweep_invalid().await, 0);
    assert_eq!(dialer.closed_count(), 0);
    assert!(sessions.get_session(&session.id).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_session_running_a_command_is_not_swept() {
    let dialer = Arc::new(MockDialer::new());
    dialer.respond_after("helm install", Duration::from_secs(20 * 60));
    let sessions = manager(&dialer);
    let session = open(&sessions).await;

    let conn = session.connection().clone();
    let install = tokio::spawn(async move { executor::execute(&conn, "helm install demo").await });

    tokio::time::sleep(Duration::from_secs(16 * 60)).await;
    assert!(session.is_busy());
    assert_eq!(sessions.sweep_invalid().await, 0);
    assert_eq!(sessions.len().await, 1);
    assert_eq!(dialer.closed_count(), 0);

    assert!(install.await.unwrap().success());
    assert!(!session.is_busy());
    assert_eq!(sessions.sweep_invalid().await, 0);

    // Max age still applies once the command is done
    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    assert_eq!(sessions.sweep_invalid().await, 1);
    assert_eq!(dialer.closed_count(), 1);
}
