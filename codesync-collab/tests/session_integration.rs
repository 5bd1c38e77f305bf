//! End-to-end session tests: two sessions talking through a real relay.

use std::sync::Arc;

use async_trait::async_trait;
use codesync_collab::config::CollabConfig;
use codesync_collab::cursor::{CursorSource, DecorationKind};
use codesync_collab::protocol::{FileId, ParticipantId, SessionIdentity};
use codesync_collab::save::SaveNotice;
use codesync_collab::server::{RelayServer, ServerConfig};
use codesync_collab::session::{
    CollabSession, EditorSurface, SessionHandle, SessionManager, SessionSnapshot,
};
use codesync_collab::store::{FileStore, MemoryFileStore, StoreError};
use codesync_collab::{Decoration, RosterEntry};
use tokio::time::{timeout, Duration};

/// A surface that renders nothing; tests observe through snapshots.
struct Headless;

impl EditorSurface for Headless {
    fn render_decorations(&mut self, _file_id: Option<&FileId>, _decorations: &[Decoration]) {}
    fn replace_visible_text(&mut self, _file_id: &FileId, _content: &str) {}
    fn show_notice(&mut self, _notice: &SaveNotice) {}
    fn roster_changed(&mut self, _roster: &[RosterEntry]) {}
    fn connection_changed(&mut self, _connected: bool) {}
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = RelayServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn config(port: u16) -> CollabConfig {
    CollabConfig {
        debounce_ms: 50,
        notice_ttl_ms: 10_000,
        reconnect_base_delay_ms: 20,
        ..CollabConfig::default()
    }
    .with_server_url(format!("ws://127.0.0.1:{port}/ws/collaboration"))
}

fn store() -> Arc<MemoryFileStore> {
    Arc::new(MemoryFileStore::with_files([
        ("a.js", "v1"),
        ("b.js", "b"),
        ("app.py", "print(0)"),
    ]))
}

/// Store whose reads take a while, holding up the session loop.
struct SlowStore {
    inner: MemoryFileStore,
    delay: Duration,
}

#[async_trait]
impl FileStore for SlowStore {
    async fn read(&self, file_id: &FileId) -> Result<String, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(file_id).await
    }

    async fn write(&self, file_id: &FileId, content: &str) -> Result<(), StoreError> {
        self.inner.write(file_id, content).await
    }
}

async fn start(port: u16, project: &str, user: &str, store: Arc<MemoryFileStore>) -> SessionHandle {
    CollabSession::start(
        SessionIdentity::new(project, user, user.to_uppercase()),
        config(port),
        store,
        Headless,
    )
    .await
    .unwrap()
}

/// Poll snapshots until `check` holds.
async fn wait_for(
    session: &SessionHandle,
    what: &str,
    check: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let result = timeout(Duration::from_secs(3), async {
        loop {
            let snapshot = session.snapshot().await.unwrap();
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    match result {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

fn sees(snapshot: &SessionSnapshot, user: &str) -> bool {
    snapshot.participant_ids().contains(&ParticipantId::from(user))
}

/// Two connected sessions in the same project that see each other.
async fn pair(port: u16, store: Arc<MemoryFileStore>) -> (SessionHandle, SessionHandle) {
    let alice = start(port, "42", "alice", store.clone()).await;
    wait_for(&alice, "alice connected", |s| s.connected).await;
    let bob = start(port, "42", "bob", store).await;
    wait_for(&bob, "bob sees alice", |s| s.connected && sees(s, "alice")).await;
    wait_for(&alice, "alice sees bob", |s| sees(s, "bob")).await;
    (alice, bob)
}

#[tokio::test]
async fn test_roster_lists_self_first() {
    let port = start_test_server().await;
    let (alice, bob) = pair(port, store()).await;

    let roster = bob.roster().await.unwrap();
    assert_eq!(roster.len(), 2);
    assert!(roster[0].is_self);
    assert_eq!(roster[0].participant.id.as_str(), "bob");
    assert_eq!(roster[1].participant.display_name, "ALICE");

    alice.shutdown().await;
    wait_for(&bob, "alice gone", |s| !sees(s, "alice")).await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_remote_cursor_decorates_shared_file() {
    let port = start_test_server().await;
    let (alice, bob) = pair(port, store()).await;
    alice.open_file("a.js", "a.js").await.unwrap();
    bob.open_file("a.js", "a.js").await.unwrap();

    alice
        .cursor_moved("a.js", 3, 5, CursorSource::PositionChanged)
        .await
        .unwrap();

    let snapshot = wait_for(&bob, "alice's cursor", |s| {
        s.decorations.iter().any(|d| d.participant_id.as_str() == "alice")
    })
    .await;
    let remote: Vec<&Decoration> = snapshot
        .decorations
        .iter()
        .filter(|d| d.participant_id.as_str() == "alice")
        .collect();
    assert_eq!(remote.len(), 2);
    let caret = remote
        .iter()
        .find(|d| d.kind == DecorationKind::Caret)
        .unwrap();
    assert_eq!(caret.range.start_line, 3);
    assert_eq!(caret.range.start_column, 5);
    assert_eq!(caret.range.end_column, 6);
    assert!(!caret.is_self);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_debounced_edit_reaches_peer() {
    let port = start_test_server().await;
    let (alice, bob) = pair(port, store()).await;
    alice.open_file("a.js", "a.js").await.unwrap();
    bob.open_file("a.js", "a.js").await.unwrap();

    alice.local_edit("a.js", "v1 a").await.unwrap();
    alice.local_edit("a.js", "v1 ab").await.unwrap();

    let snapshot = wait_for(&bob, "edit applied", |s| {
        s.buffer(&FileId::from("a.js"))
            .is_some_and(|b| b.content == "v1 ab")
    })
    .await;
    let buffer = snapshot.buffer(&FileId::from("a.js")).unwrap();
    assert_eq!(buffer.last_synced_content, "v1 ab");

    let own = wait_for(&alice, "debounce flushed", |s| s.pending_change.is_none()).await;
    assert!(own.buffer(&FileId::from("a.js")).unwrap().unsaved);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_save_persists_and_notifies_peer() {
    let port = start_test_server().await;
    let shared = store();
    let (alice, bob) = pair(port, shared.clone()).await;
    alice.open_file("a.js", "a.js").await.unwrap();
    bob.open_file("a.js", "a.js").await.unwrap();

    alice.local_edit("a.js", "saved text").await.unwrap();
    alice.save_file("a.js").await.unwrap();
    assert_eq!(
        shared.read(&FileId::from("a.js")).await.unwrap(),
        "saved text"
    );

    let snapshot = wait_for(&bob, "save notice", |s| !s.notices.is_empty()).await;
    assert_eq!(snapshot.notices[0].by_whom, "ALICE");
    assert_eq!(snapshot.notices[0].file_name, "a.js");
    let buffer = snapshot.buffer(&FileId::from("a.js")).unwrap();
    assert_eq!(buffer.content, "saved text");
    assert!(!buffer.unsaved);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_failed_save_keeps_buffer_unsaved() {
    let port = start_test_server().await;
    let shared = store();
    let alice = start(port, "42", "alice", shared.clone()).await;
    alice.open_file("a.js", "a.js").await.unwrap();
    alice.local_edit("a.js", "draft").await.unwrap();

    shared.set_fail_writes(true);
    assert!(alice.save_file("a.js").await.is_err());
    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.buffer(&FileId::from("a.js")).unwrap().unsaved);

    alice.shutdown().await;
}

#[tokio::test]
async fn test_chat_reaches_peer() {
    let port = start_test_server().await;
    let (alice, bob) = pair(port, store()).await;

    alice.send_chat("hello bob").await.unwrap();
    let snapshot = wait_for(&bob, "chat", |s| !s.chat.is_empty()).await;
    assert_eq!(snapshot.chat[0].message, "hello bob");
    assert_eq!(snapshot.chat[0].from.as_str(), "alice");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_manager_switch_leaves_previous_project() {
    let port = start_test_server().await;
    let shared = store();
    let observer = start(port, "42", "bob", shared.clone()).await;
    wait_for(&observer, "observer connected", |s| s.connected).await;

    let mut manager = SessionManager::new(config(port), shared);
    manager
        .open_project(SessionIdentity::new("42", "alice", "Alice"), Headless)
        .await
        .unwrap();
    wait_for(&observer, "alice joined", |s| sees(s, "alice")).await;

    let current = manager
        .open_project(SessionIdentity::new("7", "alice", "Alice"), Headless)
        .await
        .unwrap();
    assert_eq!(current.project_id().as_str(), "7");
    wait_for(&observer, "alice left", |s| !sees(s, "alice")).await;

    manager.close().await;
    assert!(manager.current().is_none());
    observer.shutdown().await;
}

#[tokio::test]
async fn test_remote_edit_to_unopened_file_not_applied_on_open() {
    let port = start_test_server().await;
    let shared = store();
    let (alice, bob) = pair(port, shared.clone()).await;

    bob.open_file("app.py", "app.py").await.unwrap();
    bob.local_edit("app.py", "print(1)").await.unwrap();
    wait_for(&bob, "edit flushed", |s| s.pending_change.is_none()).await;
    // Chat is relayed in order, so once it lands the edit has too.
    bob.send_chat("done").await.unwrap();
    let snapshot = wait_for(&alice, "chat", |s| !s.chat.is_empty()).await;
    assert!(snapshot.buffer(&FileId::from("app.py")).is_none());

    alice.open_file("app.py", "app.py").await.unwrap();
    let snapshot = alice.snapshot().await.unwrap();
    let buffer = snapshot.buffer(&FileId::from("app.py")).unwrap();
    let persisted = shared.read(&FileId::from("app.py")).await.unwrap();
    assert_eq!(buffer.content, persisted);
    assert_eq!(buffer.content, "print(0)");
    assert!(!buffer.unsaved);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_burst_during_slow_read_is_not_dropped() {
    let port = start_test_server().await;
    let alice = start(port, "42", "alice", store()).await;
    wait_for(&alice, "alice connected", |s| s.connected).await;

    let slow = Arc::new(SlowStore {
        inner: MemoryFileStore::with_files([("a.js", "v1")]),
        delay: Duration::from_millis(800),
    });
    let bob = CollabSession::start(
        SessionIdentity::new("42", "bob", "BOB"),
        CollabConfig {
            bus_capacity: 16,
            inbound_capacity: 16,
            ..config(port)
        },
        slow,
        Headless,
    )
    .await
    .unwrap();
    wait_for(&bob, "bob sees alice", |s| s.connected && sees(s, "alice")).await;
    wait_for(&alice, "alice sees bob", |s| sees(s, "bob")).await;

    let burst = async {
        for i in 0..150 {
            alice.send_chat(format!("m{i}")).await.unwrap();
        }
    };
    let (opened, ()) = tokio::join!(bob.open_file("a.js", "a.js"), burst);
    opened.unwrap();

    let snapshot = wait_for(&bob, "whole burst", |s| s.chat.len() == 150).await;
    let messages: Vec<&str> = snapshot.chat.iter().map(|c| c.message.as_str()).collect();
    let expected: Vec<String> = (0..150).map(|i| format!("m{i}")).collect();
    assert_eq!(messages, expected);

    alice.shutdown().await;
    bob.shutdown().await;
}
