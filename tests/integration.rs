//! End-to-end tests driving real TCP sockets through the router and codec,
//! covering the boundary scenarios in the specification's testable
//! properties section.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use collabpad::codec::Message;
use collabpad::config::Config;
use collabpad::error::EngineError;
use collabpad::router::Router;
use collabpad::session::Session;
use collabpad::storage::FileDocumentStore;
use collabpad::users::{FileUserStore, UserStore};
use tempfile::tempdir;

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Builds a router backed by temp-dir storage, with `usernames` already
/// registered (password `hunter2` for all) before the router ever sees the
/// user store.
fn router(dir: &tempfile::TempDir, usernames: &[&str]) -> Router {
    let user_store = FileUserStore::open(dir.path().join("users.txt")).unwrap();
    for username in usernames {
        user_store.register(username, "hunter2").unwrap();
    }
    let storage = Arc::new(FileDocumentStore::new(dir.path().join("docs"), 1024 * 1024));
    Router::new(Arc::new(user_store), storage, Config::default())
}

fn login(router: &Router, session: &Arc<Session>, username: &str) {
    let reply = router
        .dispatch(session, Message::Login { username: username.into(), password: "hunter2".into() })
        .unwrap();
    assert!(matches!(reply, Some(Message::LoginAck { status: collabpad::codec::Status::Success, .. })));
}

#[test]
fn auth_required_rejects_edit_before_login_property_7() {
    let dir = tempdir().unwrap();
    let router = router(&dir, &[]);
    let (_client, server) = socket_pair();
    let session = Session::new(&server, "temp-1".into()).unwrap();

    let result = router.dispatch(&session, Message::TextInsert { file_id: "f1".into(), position: 0, text: "x".into() });
    assert!(matches!(result, Err(EngineError::AuthRequired)));
}

#[test]
fn concurrent_insert_broadcast_excludes_originator_and_uses_applied_position() {
    // Scenario S1: two real sockets, both with the same file open. Alice
    // inserts; Bob's socket must receive the broadcast (not Alice's), and it
    // must carry the applied_position, not the literal submitted one.
    let dir = tempdir().unwrap();
    let router = router(&dir, &["alice", "bob"]);

    let (mut alice_client, alice_server) = socket_pair();
    let alice = Session::new(&alice_server, "temp-a".into()).unwrap();
    let (mut bob_client, bob_server) = socket_pair();
    let bob = Session::new(&bob_server, "temp-b".into()).unwrap();

    login(&router, &alice, "alice");
    login(&router, &bob, "bob");

    let reply = router.dispatch(&alice, Message::FileCreate { name: "doc.txt".into() }).unwrap().unwrap();
    let file_id = match reply {
        Message::FileContent { file_id, .. } => file_id,
        other => panic!("unexpected {other:?}"),
    };
    router.dispatch(&bob, Message::FileOpen { file_id: file_id.clone() }).unwrap();

    let reply = router
        .dispatch(&alice, Message::TextInsert { file_id: file_id.clone(), position: 0, text: "hello".into() })
        .unwrap();
    assert_eq!(reply, None);

    // Bob's socket should have exactly one TEXT_UPDATE line waiting; Alice's
    // socket should have nothing (she is the originator).
    bob_client.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
    let mut reader = std::io::BufReader::new(&mut bob_client);
    let mut line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
    let codec = router.codec();
    let decoded = codec.decode(line.trim_end()).unwrap();
    match decoded {
        Message::TextUpdate { position, text, .. } => {
            assert_eq!(position, 0);
            assert_eq!(text.as_deref(), Some("hello"));
        }
        other => panic!("unexpected {other:?}"),
    }

    alice_client.set_read_timeout(Some(std::time::Duration::from_millis(100))).unwrap();
    let mut alice_reader = std::io::BufReader::new(&mut alice_client);
    let mut alice_line = String::new();
    let err = std::io::BufRead::read_line(&mut alice_reader, &mut alice_line);
    assert!(err.is_err() || alice_line.is_empty(), "originator must not receive its own broadcast");
}

#[test]
fn concurrent_delete_broadcast_uses_applied_position_and_length_s4() {
    // Scenario S4: start "abcdef". Alice's history already has delete(1,3)
    // applied ("bcd" removed, current content "aef"). Bob, working from his
    // stale view of "abcdef", then submits delete(2,3) (targeting "cde" in
    // the original text). Since the two ops have different authors, the
    // identity rule does not bypass the transform: the engine must reduce
    // Bob's op to delete(1,1) on the true content "aef" and broadcast
    // exactly that applied position/length, not Bob's raw (2,3) — otherwise
    // Alice's already-synced "aef" buffer would have the wrong range deleted
    // and permanently diverge.
    // A narrow transform window of 1 models Bob's view already reflecting
    // the insert (he joined after it) and only missing the one delete that
    // happened next — the window the engine actually folds his submission
    // through should contain just that one op, matching S4 literally.
    let dir = tempdir().unwrap();
    let user_store = FileUserStore::open(dir.path().join("users.txt")).unwrap();
    user_store.register("alice", "hunter2").unwrap();
    user_store.register("bob", "hunter2").unwrap();
    let storage = Arc::new(FileDocumentStore::new(dir.path().join("docs"), 1024 * 1024));
    let config = Config {
        transform_window: 1,
        ..Config::default()
    };
    let router = Router::new(Arc::new(user_store), storage, config);

    let (mut alice_client, alice_server) = socket_pair();
    let alice = Session::new(&alice_server, "temp-a".into()).unwrap();
    let (_bob_client, bob_server) = socket_pair();
    let bob = Session::new(&bob_server, "temp-b".into()).unwrap();

    login(&router, &alice, "alice");
    login(&router, &bob, "bob");

    let reply = router.dispatch(&alice, Message::FileCreate { name: "doc.txt".into() }).unwrap().unwrap();
    let file_id = match reply {
        Message::FileContent { file_id, .. } => file_id,
        other => panic!("unexpected {other:?}"),
    };
    router.dispatch(&bob, Message::FileOpen { file_id: file_id.clone() }).unwrap();

    router.dispatch(&alice, Message::TextInsert { file_id: file_id.clone(), position: 0, text: "abcdef".into() }).unwrap();
    // Drain Alice's own broadcasts isn't needed since she's the originator of
    // the following two ops; only Bob's later submission broadcasts to her.
    router.dispatch(&alice, Message::TextDelete { file_id: file_id.clone(), position: 1, length: 3 }).unwrap();

    let doc_content_before = router.documents.get(&file_id).unwrap().content();
    assert_eq!(doc_content_before, "aef");

    // Bob submits delete(2,3) against his stale view of "abcdef" (targeting
    // "cde"), processed after Alice's delete above is already history.
    let reply = router
        .dispatch(&bob, Message::TextDelete { file_id: file_id.clone(), position: 2, length: 3 })
        .unwrap();
    assert_eq!(reply, None);

    alice_client.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
    let mut reader = std::io::BufReader::new(&mut alice_client);
    let mut line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
    let codec = router.codec();
    let decoded = codec.decode(line.trim_end()).unwrap();
    match decoded {
        Message::TextUpdate { position, length, .. } => {
            assert_eq!(position, 1, "broadcast must carry the transformed position, not Bob's raw 2");
            assert_eq!(length, Some(1), "broadcast must carry the transformed length, not Bob's raw 3");
        }
        other => panic!("unexpected {other:?}"),
    }

    let doc = router.documents.get(&file_id).unwrap();
    assert_eq!(doc.content(), "af");
}

#[test]
fn file_delete_busy_with_multiple_participants() {
    let dir = tempdir().unwrap();
    let router = router(&dir, &["alice", "bob"]);
    let (_c1, s1) = socket_pair();
    let creator = Session::new(&s1, "temp-1".into()).unwrap();
    let (_c2, s2) = socket_pair();
    let other = Session::new(&s2, "temp-2".into()).unwrap();

    login(&router, &creator, "alice");
    login(&router, &other, "bob");

    let reply = router.dispatch(&creator, Message::FileCreate { name: "shared.txt".into() }).unwrap().unwrap();
    let file_id = match reply {
        Message::FileContent { file_id, .. } => file_id,
        other => panic!("unexpected {other:?}"),
    };
    router.dispatch(&other, Message::FileOpen { file_id: file_id.clone() }).unwrap();

    let reply = router.dispatch(&creator, Message::FileDelete { file_id }).unwrap().unwrap();
    assert!(matches!(reply, Message::FileDeleteAck { status: collabpad::codec::Status::Fail, .. }));
}

#[test]
fn stale_insert_past_end_clamps_over_real_socket_s5() {
    let dir = tempdir().unwrap();
    let router = router(&dir, &["alice"]);
    let (_client, server) = socket_pair();
    let session = Session::new(&server, "temp-1".into()).unwrap();
    login(&router, &session, "alice");

    let reply = router.dispatch(&session, Message::FileCreate { name: "notes.txt".into() }).unwrap().unwrap();
    let file_id = match reply {
        Message::FileContent { file_id, .. } => file_id,
        other => panic!("unexpected {other:?}"),
    };
    router.dispatch(&session, Message::TextInsert { file_id: file_id.clone(), position: 0, text: "abc".into() }).unwrap();
    let reply = router.dispatch(&session, Message::TextInsert { file_id, position: 10, text: "Z".into() });
    assert_eq!(reply.unwrap(), None);
}
