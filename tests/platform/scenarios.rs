//! Full-stack scenarios through the assembled platform.

use std::time::Duration;

use loamdb::{
    Document, ExecuteOp, ExecuteRequest, IsolationLevel, OpCode, Platform, PlatformConfig,
    ProjectId, Status,
};
use serde_json::json;
use tempfile::TempDir;

fn platform(dir: &TempDir) -> Platform {
    let mut config = PlatformConfig::default();
    config.data_root = dir.path().to_path_buf();
    config.engine.wal.group_batch_interval_ms = 1;
    Platform::new(config).unwrap()
}

#[test]
fn wire_to_storage_roundtrip() {
    let dir = TempDir::new().unwrap();
    let platform = platform(&dir);
    let addr = platform.serve("127.0.0.1:0").unwrap();

    let mut client = loamdb::Client::connect(&addr.to_string()).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();

    let (status, _) = client
        .call(
            OpCode::CreateCollection,
            &json!({"project": "tenant-a", "name": "notes"}),
        )
        .unwrap();
    assert_eq!(status, Status::Ok);

    let create = ExecuteRequest {
        project: "tenant-a".to_string(),
        collection: "notes".to_string(),
        op: ExecuteOp::Create,
        doc_id: None,
        payload: Some(json!({"_id": "n1", "text": "over the wire"})),
        patch: None,
        options: None,
        isolation: None,
    };
    client.execute(&create).unwrap();

    // The same document is visible through a direct engine handle
    let lease = platform
        .manager()
        .acquire(&ProjectId::new("tenant-a").unwrap())
        .unwrap();
    let engine = lease.engine();
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let doc = engine
        .collection("notes")
        .unwrap()
        .find_by_id(txn, "n1")
        .unwrap()
        .unwrap();
    assert_eq!(doc.get("text"), Some(&json!("over the wire")));
    engine.rollback(txn).unwrap();
    drop(lease);

    platform.shutdown();
}

#[test]
fn repeatable_read_across_manager_leases() {
    let dir = TempDir::new().unwrap();
    let platform = platform(&dir);
    let project = ProjectId::new("tenant-b").unwrap();

    let lease = platform.manager().acquire(&project).unwrap();
    let engine = lease.engine();
    engine.create_collection("items", None).unwrap();
    let items = engine.collection("items").unwrap();

    let setup = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    items
        .insert(setup, Document::from_value(json!({"_id": "x", "v": 100})).unwrap())
        .unwrap();
    engine.commit(setup).unwrap();

    // A second lease reaches the very same engine
    let lease2 = platform.manager().acquire(&project).unwrap();
    let engine2 = lease2.engine();

    let ta = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(
        items.find_by_id(ta, "x").unwrap().unwrap().get("v"),
        Some(&json!(100))
    );

    let tb = engine2.begin(IsolationLevel::ReadCommitted).unwrap();
    engine2
        .collection("items")
        .unwrap()
        .update(tb, "x", Document::from_value(json!({"_id": "x", "v": 200})).unwrap())
        .unwrap();
    engine2.commit(tb).unwrap();

    // The repeatable-read transaction still sees its snapshot
    assert_eq!(
        items.find_by_id(ta, "x").unwrap().unwrap().get("v"),
        Some(&json!(100))
    );
    engine.commit(ta).unwrap();

    let tc = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(
        items.find_by_id(tc, "x").unwrap().unwrap().get("v"),
        Some(&json!(200))
    );
    engine.rollback(tc).unwrap();

    platform.shutdown();
}

#[test]
fn projects_are_isolated() {
    let dir = TempDir::new().unwrap();
    let platform = platform(&dir);

    for name in ["alpha", "beta"] {
        let lease = platform
            .manager()
            .acquire(&ProjectId::new(name).unwrap())
            .unwrap();
        let engine = lease.engine();
        engine.create_collection("docs", None).unwrap();
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine
            .collection("docs")
            .unwrap()
            .insert(
                txn,
                Document::from_value(json!({"_id": "d", "owner": name})).unwrap(),
            )
            .unwrap();
        engine.commit(txn).unwrap();
    }

    let lease = platform
        .manager()
        .acquire(&ProjectId::new("alpha").unwrap())
        .unwrap();
    let engine = lease.engine();
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let doc = engine
        .collection("docs")
        .unwrap()
        .find_by_id(txn, "d")
        .unwrap()
        .unwrap();
    assert_eq!(doc.get("owner"), Some(&json!("alpha")));
    engine.rollback(txn).unwrap();

    platform.shutdown();
}
