//! Integration tests for the session store
//!
//! These drive the supervisor, the journal and the coordinator link together,
//! the way the binary wires them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use statesync::app::dice::{DiceConfig, DiceGame, DiceMethod, DiceView, DiceViewDiff};
use statesync::core::codec::encode_to_vec;
use statesync::core::diff::Diffable;
use statesync::core::hash::view_digest;
use statesync::journal::{replay, Journal, LogRecord};
use statesync::network::coordinator::{self, CoordinatorConfig, CoordinatorHandle};
use statesync::network::protocol::{encode_frame, Inbound, Outbound};
use statesync::network::update::StateUpdate;
use statesync::{Application, SessionId, StoreSupervisor, UserId};
use tokio::sync::{broadcast, mpsc};

fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("statesync-it-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn new_session(id: u64, user: &str, target: u32) -> Inbound {
    Inbound::NewSession {
        session: SessionId(id),
        user: UserId::from(user),
        args: encode_to_vec(&DiceConfig { target }),
    }
}

fn subscribe(id: u64, user: &str) -> Inbound {
    Inbound::Subscribe {
        session: SessionId(id),
        user: UserId::from(user),
    }
}

fn invoke(id: u64, user: &str, corr: u32, method: DiceMethod) -> Inbound {
    let (method, args) = method.to_call();
    Inbound::Invoke {
        session: SessionId(id),
        user: UserId::from(user),
        method,
        correlation_id: corr,
        args,
    }
}

/// SESSION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    fn supervisor(dir: &Path) -> (StoreSupervisor<DiceGame>, mpsc::UnboundedReceiver<Outbound>) {
        let journal = Journal::open(dir, false).unwrap();
        let (handle, rx) = CoordinatorHandle::channel();
        (StoreSupervisor::new(Arc::new(DiceGame), journal, handle), rx)
    }

    /// A restarted process rebuilds the same view from the journal alone
    #[tokio::test]
    async fn restart_recovers_identical_view() {
        let dir = temp_dir("restart");
        let live_view;
        {
            let (sup, _rx) = supervisor(&dir);
            sup.handle(new_session(1, "alice", 40), 1_000).await;
            sup.handle(subscribe(1, "alice"), 1_000).await;
            sup.handle(invoke(1, "bob", 1, DiceMethod::Join), 1_010).await;
            for i in 0..10 {
                sup.handle(invoke(1, "alice", 10 + i, DiceMethod::Roll), 1_100 + i as u64).await;
                sup.handle(invoke(1, "bob", 20 + i, DiceMethod::Roll), 1_100 + i as u64).await;
                sup.tick_all(100, 1_150 + i as u64).await;
            }
            let session = sup.get(SessionId(1)).await.unwrap();
            live_view = session.lock().await.view_for(&UserId::from("alice"));
            sup.close_all().await;
        }

        let (sup, mut rx) = supervisor(&dir);
        sup.handle(subscribe(1, "alice"), 5_000).await;
        let session = sup.get(SessionId(1)).await.unwrap();
        assert_eq!(session.lock().await.view_for(&UserId::from("alice")), live_view);

        // The first publish after recovery is a full view
        sup.publish_dirty().await;
        let Ok(Outbound::Publish { data, .. }) = rx.try_recv() else {
            panic!("expected a publish");
        };
        let update = StateUpdate::<DiceViewDiff>::from_bytes(&data).unwrap();
        let mut client = DiceView::default();
        client.patch(update.changeset.unwrap());
        assert_eq!(Some(client), live_view);
    }

    /// Last unsubscribe retires the session but keeps its journal
    #[tokio::test]
    async fn retire_keeps_journal() {
        let dir = temp_dir("retire");
        let (sup, _rx) = supervisor(&dir);
        sup.handle(new_session(2, "alice", 0), 0).await;
        sup.handle(subscribe(2, "alice"), 0).await;
        sup.handle(
            Inbound::Unsubscribe {
                session: SessionId(2),
                user: UserId::from("alice"),
            },
            1,
        )
        .await;

        assert_eq!(sup.session_count().await, 0);
        let journal = Journal::open(dir, false).unwrap();
        assert_eq!(journal.sessions().unwrap(), vec![SessionId(2)]);
    }

    /// A corrupt journal is reported as an unknown session
    #[tokio::test]
    async fn corrupt_journal_is_unknown_session() {
        let dir = temp_dir("corrupt");
        let journal = Journal::open(dir.clone(), false).unwrap();
        std::fs::write(
            journal.path_for(SessionId(3)),
            statesync::journal::frame::encode_frame(0, &[0xAA]),
        )
        .unwrap();

        let (sup, mut rx) = supervisor(&dir);
        sup.handle(subscribe(3, "alice"), 0).await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::UnknownSession { .. })));
        assert_eq!(sup.session_count().await, 0);
    }
}

/// DETERMINISM TESTS
mod replay_tests {
    use super::*;

    /// Replaying the same journal twice gives byte-identical encoded views
    #[tokio::test]
    async fn replay_is_byte_identical() {
        let dir = temp_dir("replay");
        let journal = Journal::open(dir.clone(), false).unwrap();
        let (handle, _rx) = CoordinatorHandle::channel();
        let sup = StoreSupervisor::new(Arc::new(DiceGame), journal.clone(), handle);

        sup.handle(new_session(4, "alice", 25), 100).await;
        sup.handle(invoke(4, "bob", 1, DiceMethod::Join), 110).await;
        sup.handle(invoke(4, "carol", 2, DiceMethod::Join), 120).await;
        for i in 0..30u32 {
            let user = ["alice", "bob", "carol"][(i % 3) as usize];
            let method = if i % 4 == 3 { DiceMethod::Hold } else { DiceMethod::Roll };
            sup.handle(invoke(4, user, 100 + i, method), 200 + i as u64).await;
            sup.tick_all(250, 210 + i as u64).await;
        }

        let entries = journal.load(SessionId(4)).unwrap();
        let a = replay(&DiceGame, &entries).unwrap();
        let b = replay(&DiceGame, &entries).unwrap();
        for user in ["alice", "bob", "carol"] {
            let user = UserId::from(user);
            let view_a = encode_to_vec(&DiceGame.project(&a.state, &user));
            let view_b = encode_to_vec(&DiceGame.project(&b.state, &user));
            assert_eq!(view_a, view_b);
            assert_eq!(view_digest(&view_a), view_digest(&view_b));
        }

        let session = sup.get(SessionId(4)).await.unwrap();
        assert_eq!(session.lock().await.state(), Some(&a.state));
    }
}

/// CONCURRENCY TESTS
mod isolation_tests {
    use super::*;

    const SESSIONS: u64 = 16;
    const JOINS: usize = 20;

    /// Concurrent calls on many sessions never cross journals
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions_stay_isolated() {
        let dir = temp_dir("stress");
        let journal = Journal::open(dir, false).unwrap();
        let (handle, _rx) = CoordinatorHandle::channel();
        let sup = Arc::new(StoreSupervisor::new(Arc::new(DiceGame), journal.clone(), handle));

        for id in 0..SESSIONS {
            sup.handle(new_session(id, &format!("s{}-host", id), 0), 0).await;
        }

        let mut tasks = Vec::new();
        for id in 0..SESSIONS {
            let sup = sup.clone();
            tasks.push(tokio::spawn(async move {
                for k in 0..JOINS {
                    let user = format!("s{}-u{}", id, k);
                    sup.handle(invoke(id, &user, k as u32, DiceMethod::Join), k as u64).await;
                    sup.handle(invoke(id, &format!("s{}-host", id), 0, DiceMethod::Roll), k as u64)
                        .await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        let ticker = {
            let sup = sup.clone();
            tokio::spawn(async move {
                for t in 0..50 {
                    sup.tick_all(10, t).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for task in tasks {
            task.await.unwrap();
        }
        ticker.await.unwrap();

        for id in 0..SESSIONS {
            let prefix = format!("s{}-", id);
            let entries = journal.load(SessionId(id)).unwrap();

            let joins: Vec<String> = entries
                .iter()
                .filter_map(|e| match &e.record {
                    LogRecord::Invoke { method: 0, user, .. } => Some(user.to_string()),
                    _ => None,
                })
                .collect();
            let expected: Vec<String> = (0..JOINS).map(|k| format!("s{}-u{}", id, k)).collect();
            assert_eq!(joins, expected, "session {} join order", id);

            for entry in &entries {
                match &entry.record {
                    LogRecord::Genesis { user, .. } | LogRecord::Invoke { user, .. } => {
                        assert!(user.as_str().starts_with(&prefix), "foreign record in session {}", id);
                    }
                    LogRecord::Tick { .. } => {}
                }
            }

            let replayed = replay(&DiceGame, &entries).unwrap();
            let session = sup.get(SessionId(id)).await.unwrap();
            let store = session.lock().await;
            assert_eq!(store.state(), Some(&replayed.state));
            assert_eq!(store.state().unwrap().players.len(), JOINS + 1);
        }
    }
}

/// COORDINATOR LINK TESTS
mod coordinator_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len = [0u8; 4];
        timeout(WAIT, stream.read_exact(&mut len)).await.unwrap().unwrap();
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        timeout(WAIT, stream.read_exact(&mut payload)).await.unwrap().unwrap();
        payload
    }

    async fn read_outbound(stream: &mut TcpStream) -> Outbound {
        Outbound::from_bytes(&read_frame(stream).await).unwrap()
    }

    async fn send(stream: &mut TcpStream, messages: &[Inbound]) {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend(encode_frame(&message.to_bytes()));
        }
        stream.write_all(&bytes).await.unwrap();
    }

    /// Full path: register, create, subscribe, call, publish, reconnect, resync
    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = CoordinatorConfig {
            addr: listener.local_addr().unwrap().to_string(),
            app_secret: "test-secret".to_string(),
            store_id: uuid::Uuid::new_v4(),
            auth: Default::default(),
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
        };

        let (client, handle, events) = coordinator::client(config);
        let journal = Journal::open(temp_dir("e2e"), false).unwrap();
        let sup = Arc::new(StoreSupervisor::new(Arc::new(DiceGame), journal, handle));
        let (shutdown_tx, _) = broadcast::channel(1);

        let client_task = tokio::spawn(client.run(shutdown_tx.subscribe()));
        let sup_task = {
            let sup = sup.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                sup.run(events, Duration::from_millis(20), Duration::from_millis(10), shutdown_rx)
                    .await
            })
        };

        // Registration
        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let registration: serde_json::Value =
            serde_json::from_slice(&read_frame(&mut socket).await).unwrap();
        assert_eq!(registration["appSecret"], "test-secret");

        // Unknown session
        send(&mut socket, &[subscribe(99, "alice")]).await;
        assert_eq!(
            read_outbound(&mut socket).await,
            Outbound::UnknownSession {
                session: SessionId(99),
                user: UserId::from("alice"),
            }
        );

        // Coalesced frames: create, subscribe, call
        let (tag, args) = DiceMethod::SetTarget { target: 30 }.to_call();
        send(
            &mut socket,
            &[
                new_session(1, "alice", 15),
                subscribe(1, "alice"),
                Inbound::Invoke {
                    session: SessionId(1),
                    user: UserId::from("alice"),
                    method: tag,
                    correlation_id: 7,
                    args,
                },
            ],
        )
        .await;

        let mut client_view = DiceView::default();
        let mut answered = false;
        while !answered {
            let Outbound::Publish { session, user, data } = read_outbound(&mut socket).await else {
                panic!("expected a publish");
            };
            assert_eq!((session, user), (SessionId(1), UserId::from("alice")));
            let update = StateUpdate::<DiceViewDiff>::from_bytes(&data).unwrap();
            if let Some(changeset) = update.changeset {
                client_view.patch(changeset);
            }
            answered = update
                .responses
                .iter()
                .any(|r| r.correlation_id == 7 && r.error.is_none());
        }
        assert_eq!(client_view.target, 30);
        assert!(client_view.your_turn);

        // Drop the link; the store reconnects and resends a full view
        drop(socket);
        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        read_frame(&mut socket).await;

        let Outbound::Publish { data, .. } = read_outbound(&mut socket).await else {
            panic!("expected a resync publish");
        };
        let update = StateUpdate::<DiceViewDiff>::from_bytes(&data).unwrap();
        let mut fresh = DiceView::default();
        fresh.patch(update.changeset.unwrap());
        assert_eq!(fresh, client_view);

        shutdown_tx.send(()).unwrap();
        assert!(client_task.await.unwrap().is_ok());
        sup_task.await.unwrap();
        assert_eq!(sup.session_count().await, 0);
    }
}
