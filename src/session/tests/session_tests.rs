use super::helpers::*;
use crate::error::SessionError;
use crate::session::{AddClientRequest, AddProxyRequest, SessionCommand, SessionStatus, StatusEvent};

#[tokio::test]
async fn test_save_then_open_restores_client_order() {
    let daemon = TestDaemon::start();
    let gig = daemon.session_path("gig");
    daemon.handle.new_session(&gig).await.unwrap();

    for executable in ["drums", "bass", "drums"] {
        daemon
            .handle
            .add_client(AddClientRequest::new(executable))
            .await
            .unwrap();
    }
    let mut proxy = AddProxyRequest::new("synth");
    proxy.save_signal = Some(10);
    daemon.handle.add_proxy(proxy).await.unwrap();

    let report = daemon.handle.save().await.unwrap();
    assert!(report.persisted);
    let first = read_descriptor(&gig);
    let ids: Vec<&str> = first.clients.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["drums", "bass", "drums_2", "synth"]);

    daemon.handle.close().await.unwrap();
    assert_eq!(daemon.handle.snapshot().status, SessionStatus::Off);

    daemon.handle.open(&gig).await.unwrap();
    let snapshot = daemon.handle.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Ready);
    let reopened: Vec<&str> = snapshot.clients.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(reopened, ids);
    assert!(snapshot.client("synth").unwrap().proxy);

    // Saving again without changes writes the same client list.
    daemon.handle.save().await.unwrap();
    assert_eq!(read_descriptor(&gig).clients, first.clients);
    daemon.stop().await;
}

#[tokio::test]
async fn test_open_locked_session_leaves_no_state() {
    let owner = TestDaemon::start();
    let gig = owner.session_path("gig");
    owner.handle.new_session(&gig).await.unwrap();

    let intruder = TestDaemon::start_at(&owner.root, fast_timeouts());
    let mut feed = intruder.handle.subscribe();
    let err = intruder.handle.open(&gig).await.unwrap_err();
    assert_eq!(err, SessionError::SessionLockedByAnotherProcess { path: gig.clone() });

    let snapshot = intruder.handle.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Off);
    assert!(snapshot.name.is_none());
    let events = collect_until(&mut feed, |e| {
        matches!(
            e,
            StatusEvent::Session {
                status: SessionStatus::Off,
                ..
            }
        )
    })
    .await;
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::Session {
            status: SessionStatus::Invalid,
            ..
        }
    )));

    // Still usable by its owner.
    owner.handle.save().await.unwrap();
    intruder.stop().await;
    owner.stop().await;
}

#[tokio::test]
async fn test_open_distinguishes_missing_and_corrupt() {
    let daemon = TestDaemon::start();
    let missing = daemon.session_path("nowhere");
    assert_eq!(
        daemon.handle.open(&missing).await.unwrap_err(),
        SessionError::SessionDoesNotExist { path: missing }
    );

    let broken = daemon.session_path("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("session.json"), "{ not json").unwrap();
    let err = daemon.handle.open(&broken).await.unwrap_err();
    assert!(matches!(err, SessionError::CannotLoadSessionFile { .. }));
    assert_eq!(daemon.handle.snapshot().status, SessionStatus::Off);
    daemon.stop().await;
}

#[tokio::test]
async fn test_new_refuses_existing_and_nested_paths() {
    let daemon = TestDaemon::start();
    let gig = daemon.session_path("gig");
    daemon.handle.new_session(&gig).await.unwrap();

    let err = daemon.handle.new_session(&gig).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionAlreadyExists { .. }));

    let nested = gig.join("inner");
    let err = daemon.handle.new_session(&nested).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionInSessionDir { .. }));

    // The loaded session is unaffected by refused creations.
    assert_eq!(daemon.handle.snapshot().path, Some(gig));
    daemon.stop().await;
}

#[tokio::test]
async fn test_relative_paths_resolve_under_root() {
    let daemon = TestDaemon::start();
    daemon.handle.new_session("relative").await.unwrap();
    let snapshot = daemon.handle.snapshot();
    assert_eq!(snapshot.path, Some(daemon.root.join("relative")));
    assert_eq!(snapshot.name.as_deref(), Some("relative"));
    daemon.stop().await;
}

#[tokio::test]
async fn test_new_while_loaded_saves_and_clears_first() {
    let daemon = TestDaemon::start();
    let first = daemon.session_path("first");
    daemon.handle.new_session(&first).await.unwrap();
    daemon
        .handle
        .add_client(AddClientRequest::new("drums"))
        .await
        .unwrap();

    let mut feed = daemon.handle.subscribe();
    daemon
        .handle
        .new_session(daemon.session_path("second"))
        .await
        .unwrap();
    let events = collect_until(&mut feed, |e| {
        matches!(
            e,
            StatusEvent::Session {
                status: SessionStatus::Ready,
                ..
            }
        )
    })
    .await;
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::Session {
            status: SessionStatus::Clear,
            ..
        }
    )));
    assert_eq!(read_descriptor(&first).clients.len(), 1);
    assert_eq!(daemon.handle.snapshot().name.as_deref(), Some("second"));
    daemon.stop().await;
}

#[tokio::test]
async fn test_duplicate_leaves_original_untouched() {
    let daemon = TestDaemon::start();
    let original = daemon.session_path("gig");
    daemon.handle.new_session(&original).await.unwrap();
    daemon
        .handle
        .add_client(AddClientRequest::new("drums"))
        .await
        .unwrap();
    daemon.handle.save().await.unwrap();
    std::fs::create_dir_all(original.join("gig.drums")).unwrap();
    std::fs::write(original.join("gig.drums/pattern.txt"), "x...x...").unwrap();
    let before = read_descriptor(&original);

    daemon.handle.duplicate("gig take 2").await.unwrap();
    let copy = daemon.session_path("gig take 2");
    let snapshot = daemon.handle.snapshot();
    assert_eq!(snapshot.path, Some(copy.clone()));
    assert_eq!(snapshot.status, SessionStatus::Ready);
    assert_eq!(
        std::fs::read_to_string(copy.join("gig take 2.drums/pattern.txt")).unwrap(),
        "x...x..."
    );

    daemon
        .handle
        .add_client(AddClientRequest::new("bass"))
        .await
        .unwrap();
    daemon.handle.save().await.unwrap();

    assert_eq!(read_descriptor(&copy).clients.len(), 2);
    let after = read_descriptor(&original);
    assert_eq!(after.clients, before.clients);
    assert_eq!(after.name, "gig");
    assert!(original.join("gig.drums/pattern.txt").exists());
    daemon.stop().await;
}

#[tokio::test]
async fn test_duplicate_onto_existing_name_fails() {
    let daemon = TestDaemon::start();
    daemon.handle.new_session(daemon.session_path("a")).await.unwrap();
    std::fs::create_dir_all(daemon.session_path("b")).unwrap();
    let err = daemon.handle.duplicate("b").await.unwrap_err();
    assert!(matches!(err, SessionError::SessionAlreadyExists { .. }));
    assert_eq!(daemon.handle.snapshot().name.as_deref(), Some("a"));
    daemon.stop().await;
}

#[tokio::test]
async fn test_switch_and_rename() {
    let daemon = TestDaemon::start();
    let a = daemon.session_path("a");
    let b = daemon.session_path("b");
    daemon.handle.new_session(&b).await.unwrap();
    daemon.handle.new_session(&a).await.unwrap();

    daemon.handle.switch(&b).await.unwrap();
    assert_eq!(daemon.handle.snapshot().path, Some(b.clone()));
    assert!(matches!(
        daemon.handle.switch(&b).await.unwrap_err(),
        SessionError::SessionAlreadyOpen { .. }
    ));

    daemon
        .handle
        .request(SessionCommand::Rename {
            name: "b renamed".to_string(),
        })
        .await
        .unwrap();
    let renamed = daemon.session_path("b renamed");
    assert_eq!(daemon.handle.snapshot().path, Some(renamed.clone()));
    assert!(!b.exists());
    assert_eq!(read_descriptor(&renamed).name, "b renamed");

    // The lock moved with the directory: the session can still be saved.
    daemon.handle.save().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_list_and_commands_without_session() {
    let daemon = TestDaemon::start();
    assert_eq!(daemon.handle.save().await.unwrap_err(), SessionError::NoSessionOpen);
    assert_eq!(daemon.handle.close().await.unwrap_err(), SessionError::NoSessionOpen);
    assert_eq!(daemon.handle.abort().await.unwrap_err(), SessionError::NoSessionOpen);

    daemon.handle.new_session(daemon.session_path("one")).await.unwrap();
    daemon.handle.new_session(daemon.session_path("two")).await.unwrap();
    let output = daemon.handle.request(SessionCommand::List).await.unwrap();
    let crate::session::CommandOutput::Sessions { sessions } = output else {
        panic!("Expected a session list");
    };
    let names: Vec<&str> = sessions.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["one", "two"]);
    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_session_and_stops_task() {
    let root = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start_at(root.path(), fast_timeouts());
    let gig = daemon.session_path("gig");
    daemon.handle.new_session(&gig).await.unwrap();
    let handle = daemon.handle.clone();
    daemon.stop().await;

    assert!(handle.snapshot().name.is_none());
    assert!(handle.save().await.is_err());
    // Lock released: another daemon can open it.
    let next = TestDaemon::start_at(root.path(), fast_timeouts());
    next.handle.open(&gig).await.unwrap();
    next.stop().await;
}
