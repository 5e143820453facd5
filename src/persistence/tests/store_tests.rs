use super::*;
use crate::client::{ClientKind, ClientSpec, ProxySettings};
use tempfile::TempDir;

fn store() -> (TempDir, SessionStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().to_path_buf());
    (dir, store)
}

fn native(id: &str) -> ClientSpec {
    ClientSpec::new(id.to_string(), id.to_string(), ClientKind::Native)
}

#[test]
fn test_create_then_load_roundtrip() {
    let (_dir, store) = store();
    let path = store.resolve(Path::new("gig"));
    let created = store.create(&path, "gig").unwrap();

    let mut descriptor = created.descriptor.clone();
    descriptor.clients = vec![native("synth"), native("drums"), native("bass")];
    SessionStore::write(&path, &descriptor).unwrap();
    drop(created);

    let loaded = store.load(&path).unwrap();
    assert_eq!(loaded.descriptor, descriptor);
    let ids: Vec<&str> = loaded.descriptor.clients.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["synth", "drums", "bass"]);
}

#[test]
fn test_create_refuses_existing_and_nested() {
    let (_dir, store) = store();
    let path = store.resolve(Path::new("gig"));
    let _session = store.create(&path, "gig").unwrap();

    assert!(matches!(
        store.create(&path, "gig"),
        Err(SessionError::SessionAlreadyExists { .. })
    ));
    assert!(matches!(
        store.create(&path.join("inner"), "inner"),
        Err(SessionError::SessionInSessionDir { .. })
    ));
}

#[test]
fn test_load_error_taxonomy() {
    let (_dir, store) = store();

    let missing = store.resolve(Path::new("nowhere"));
    assert!(matches!(
        store.load(&missing),
        Err(SessionError::SessionDoesNotExist { .. })
    ));

    let corrupt = store.resolve(Path::new("corrupt"));
    fs::create_dir_all(&corrupt).unwrap();
    fs::write(corrupt.join(DESCRIPTOR_FILE_NAME), "{ not json").unwrap();
    assert!(matches!(
        store.load(&corrupt),
        Err(SessionError::CannotLoadSessionFile { .. })
    ));
    // A failed load does not keep the lock
    assert!(SessionLock::acquire(&corrupt, Uuid::new_v4()).is_ok());

    let locked = store.resolve(Path::new("locked"));
    drop(store.create(&locked, "locked").unwrap());
    let _foreign = SessionLock::acquire(&locked, Uuid::new_v4()).unwrap();
    assert!(matches!(
        store.load(&locked),
        Err(SessionError::SessionLockedByAnotherProcess { .. })
    ));
}

#[test]
fn test_write_leaves_no_temp_file() {
    let (_dir, store) = store();
    let path = store.resolve(Path::new("gig"));
    let session = store.create(&path, "gig").unwrap();
    SessionStore::write(&path, &session.descriptor).unwrap();
    assert!(!path.join("session.json.tmp").exists());
}

#[test]
fn test_duplicate_copies_and_renames_client_dirs() {
    let (_dir, store) = store();
    let source = store.resolve(Path::new("gig"));
    let session = store.create(&source, "gig").unwrap();

    let mut descriptor = session.descriptor.clone();
    descriptor.clients.push(native("synth"));
    descriptor.clients.push(ClientSpec::new(
        "looper".to_string(),
        "looper".to_string(),
        ClientKind::Proxy(ProxySettings {
            config_file: Some(source.join("gig.looper").join("loops.conf")),
            ..ProxySettings::default()
        }),
    ));
    SessionStore::write(&source, &descriptor).unwrap();
    fs::create_dir_all(source.join("gig.synth")).unwrap();
    fs::write(source.join("gig.synth").join("patch.txt"), "saw").unwrap();
    fs::create_dir_all(source.join("gig.looper")).unwrap();
    fs::write(source.join("gig.looper").join("loops.conf"), "x").unwrap();

    let target = store.resolve(Path::new("gig-copy"));
    store.duplicate(&source, &target, "gig-copy").unwrap();

    assert_eq!(
        fs::read_to_string(target.join("gig-copy.synth").join("patch.txt")).unwrap(),
        "saw"
    );
    assert!(!target.join(lock::LOCK_FILE_NAME).exists());

    let copy = store.load(&target).unwrap();
    assert_eq!(copy.descriptor.name, "gig-copy");
    match &copy.descriptor.clients[1].kind {
        ClientKind::Proxy(settings) => assert_eq!(
            settings.config_file.as_deref(),
            Some(target.join("gig-copy.looper").join("loops.conf").as_path())
        ),
        ClientKind::Native => panic!("Wrong kind"),
    }
}

#[test]
fn test_mutating_duplicate_leaves_original_untouched() {
    let (_dir, store) = store();
    let source = store.resolve(Path::new("gig"));
    let session = store.create(&source, "gig").unwrap();
    let mut descriptor = session.descriptor.clone();
    descriptor.clients.push(native("synth"));
    SessionStore::write(&source, &descriptor).unwrap();
    let original = fs::read_to_string(SessionStore::descriptor_path(&source)).unwrap();

    let target = store.resolve(Path::new("copy"));
    store.duplicate(&source, &target, "copy").unwrap();
    let mut copy = store.load(&target).unwrap();
    copy.descriptor.clients.clear();
    copy.descriptor.clients.push(native("drums"));
    SessionStore::write(&target, &copy.descriptor).unwrap();

    assert_eq!(
        fs::read_to_string(SessionStore::descriptor_path(&source)).unwrap(),
        original
    );
}

#[test]
fn test_duplicate_failure_leaves_nothing_behind() {
    let (dir, store) = store();
    let source = store.resolve(Path::new("gig"));
    let _session = store.create(&source, "gig").unwrap();
    let target = store.resolve(Path::new("copy"));
    fs::create_dir_all(&target).unwrap();

    assert!(matches!(
        store.duplicate(&source, &target, "copy"),
        Err(SessionError::SessionAlreadyExists { .. })
    ));
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_rename_moves_directory_and_client_dirs() {
    let (_dir, store) = store();
    let source = store.resolve(Path::new("gig"));
    let session = store.create(&source, "gig").unwrap();
    let mut descriptor = session.descriptor.clone();
    descriptor.clients.push(native("synth"));
    fs::create_dir_all(source.join("gig.synth")).unwrap();

    let target = store.rename(&source, &mut descriptor, "show").unwrap();
    drop(session);

    assert!(!source.exists());
    assert!(target.join("show.synth").is_dir());
    assert_eq!(store.load(&target).unwrap().descriptor.name, "show");
}

#[test]
fn test_list_does_not_descend_into_sessions() {
    let (_dir, store) = store();
    drop(store.create(&store.resolve(Path::new("b-gig")), "b-gig").unwrap());
    drop(store.create(&store.resolve(Path::new("live/a-gig")), "a-gig").unwrap());
    // A stray descriptor inside a session is not a session of its own
    let stray = store.resolve(Path::new("b-gig/b-gig.synth"));
    fs::create_dir_all(&stray).unwrap();
    fs::write(stray.join(DESCRIPTOR_FILE_NAME), r#"{"name":"stray"}"#).unwrap();

    let sessions = store.list().unwrap();
    let names: Vec<&str> = sessions.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["b-gig", "a-gig"]);
}

#[test]
fn test_validate_session_name() {
    assert!(validate_session_name("gig 2024").is_ok());
    for bad in ["", "  ", ".hidden", "a/b", " padded"] {
        assert!(validate_session_name(bad).is_err(), "{:?} should be rejected", bad);
    }
}
