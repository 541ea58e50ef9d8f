//! Wire protocol end to end: a real server, a real client.

use std::sync::Arc;
use std::time::Duration;

use loam_core::config::{EngineOptions, ManagerConfig, PoolConfig};
use loam_net::{
    Client, ExecuteOp, ExecuteRequest, Gateway, OpCode, QueryBody, Server, ServerConfig, Status,
};
use loam_net::frame::{write_frame, Frame};
use loam_pool::InstanceManager;
use serde_json::{json, Value};
use tempfile::TempDir;

struct Harness {
    server: Server,
    _manager: Arc<InstanceManager>,
    _dir: TempDir,
}

fn harness() -> Harness {
    harness_with_max_frame(loam_net::MAX_FRAME_SIZE_DEFAULT)
}

fn harness_with_max_frame(max_frame: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let manager = InstanceManager::new(
        dir.path().to_path_buf(),
        EngineOptions::default(),
        PoolConfig::default(),
        ManagerConfig::default(),
    );
    let gateway = Arc::new(Gateway::new(Arc::clone(&manager)));
    let server = Server::start(
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_frame,
            read_timeout: Duration::from_secs(5),
        },
        gateway,
    )
    .unwrap();
    Harness {
        server,
        _manager: manager,
        _dir: dir,
    }
}

fn client(harness: &Harness) -> Client {
    let mut client = Client::connect(&harness.server.local_addr().to_string()).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client
}

fn execute(op: ExecuteOp) -> ExecuteRequest {
    ExecuteRequest {
        project: "proj1".to_string(),
        collection: "users".to_string(),
        op,
        doc_id: None,
        payload: None,
        patch: None,
        options: None,
        isolation: None,
    }
}

#[test]
fn document_crud_over_the_wire() {
    let harness = harness();
    let mut client = client(&harness);

    let (status, _) = client
        .call(
            OpCode::CreateCollection,
            &json!({"project": "proj1", "name": "users"}),
        )
        .unwrap();
    assert_eq!(status, Status::Ok);

    // Create
    let mut create = execute(ExecuteOp::Create);
    create.payload = Some(json!({"_id": "u1", "name": "Alice", "age": 30}));
    let body = client.execute(&create).unwrap();
    assert_eq!(body["_id"], json!("u1"));

    // Read
    let mut read = execute(ExecuteOp::Read);
    read.doc_id = Some("u1".to_string());
    let body = client.execute(&read).unwrap();
    assert_eq!(body["name"], json!("Alice"));

    // Update
    let mut update = execute(ExecuteOp::Update);
    update.doc_id = Some("u1".to_string());
    update.payload = Some(json!({"_id": "u1", "name": "Alice", "age": 31}));
    client.execute(&update).unwrap();

    // Query
    let mut list = execute(ExecuteOp::List);
    list.options = Some(QueryBody {
        query: json!({"age": {"$gte": 31}}),
        ..QueryBody::default()
    });
    let body = client.execute(&list).unwrap();
    assert_eq!(body["count"], json!(1));

    // Delete, then the read reports NotFound at the wire level
    let mut delete = execute(ExecuteOp::Delete);
    delete.doc_id = Some("u1".to_string());
    client.execute(&delete).unwrap();

    let mut read = execute(ExecuteOp::Read);
    read.doc_id = Some("u1".to_string());
    let (status, body) = client.call(OpCode::Execute, &read).unwrap();
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["code"], json!("not_found/document"));

    harness.server.shutdown();
}

#[test]
fn patch_over_the_wire() {
    let harness = harness();
    let mut client = client(&harness);
    client
        .call(OpCode::CreateCollection, &json!({"project": "proj1", "name": "users"}))
        .unwrap();

    let mut create = execute(ExecuteOp::Create);
    create.payload = Some(json!({"_id": "u1", "name": "Alice"}));
    client.execute(&create).unwrap();

    let mut patch = execute(ExecuteOp::Patch);
    patch.doc_id = Some("u1".to_string());
    patch.patch = serde_json::from_value(json!([
        {"op": "set", "path": "age", "value": 33},
        {"op": "remove", "path": "name"}
    ]))
    .unwrap();
    let body = client.execute(&patch).unwrap();
    assert_eq!(body["age"], json!(33));
    assert!(body.get("name").is_none());
}

#[test]
fn batch_reports_per_operation_outcomes() {
    let harness = harness();
    let mut client = client(&harness);
    client
        .call(OpCode::CreateCollection, &json!({"project": "proj1", "name": "users"}))
        .unwrap();

    let mut good = execute(ExecuteOp::Create);
    good.payload = Some(json!({"_id": "a"}));
    let mut bad = execute(ExecuteOp::Read);
    bad.doc_id = Some("missing".to_string());

    let (status, body) = client.call(OpCode::Batch, &json!([good, bad])).unwrap();
    assert_eq!(status, Status::Ok);
    let results = body.as_array().unwrap();
    assert_eq!(results[0]["status"], json!("ok"));
    assert_eq!(results[1]["status"], json!("error"));
    assert_eq!(results[1]["error"]["code"], json!("not_found/document"));
}

#[test]
fn unknown_opcode_consumes_payload_and_replies() {
    use loam_net::frame::{read_frame, FrameRead};

    let harness = harness();
    let mut stream = std::net::TcpStream::connect(harness.server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // A frame with a bogus opcode, followed by a valid request on the
    // same connection
    write_frame(&mut stream, &Frame::new(999, 7, b"{\"garbage\": true}".to_vec())).unwrap();
    match read_frame(&mut stream, loam_net::MAX_FRAME_SIZE_DEFAULT).unwrap() {
        FrameRead::Frame(reply) => {
            assert_eq!(reply.request_id, 7);
            assert_eq!(reply.flags, Status::UnknownOpcode as u16);
        }
        other => panic!("expected a reply frame, got {:?}", other),
    }

    // The payload was consumed exactly; the connection still serves
    let body = json!({"project": "p2"}).to_string().into_bytes();
    write_frame(
        &mut stream,
        &Frame::new(OpCode::ListCollections as u16, 8, body),
    )
    .unwrap();
    match read_frame(&mut stream, loam_net::MAX_FRAME_SIZE_DEFAULT).unwrap() {
        FrameRead::Frame(reply) => {
            assert_eq!(reply.request_id, 8);
            assert_eq!(reply.flags, Status::Ok as u16);
        }
        other => panic!("expected a reply frame, got {:?}", other),
    }
}

#[test]
fn oversized_frame_gets_frame_too_large() {
    let harness = harness_with_max_frame(1024);
    let mut client = client(&harness);

    let mut create = execute(ExecuteOp::Create);
    create.payload = Some(json!({"blob": "x".repeat(4096)}));
    let (status, body) = client.call(OpCode::Execute, &create).unwrap();
    assert_eq!(status, Status::FrameTooLarge);
    assert_eq!(body["code"], json!("protocol/frame_too_large"));

    // Connection still alive
    let (status, _) = client
        .call(OpCode::ListCollections, &json!({"project": "p3"}))
        .unwrap();
    assert_eq!(status, Status::Ok);
}

#[test]
fn subscribe_streams_committed_changes() {
    let harness = harness();
    let mut writer = client(&harness);
    writer
        .call(OpCode::CreateCollection, &json!({"project": "proj1", "name": "logs"}))
        .unwrap();

    let subscriber = client(&harness);
    let mut stream = subscriber.subscribe("proj1", 64).unwrap();

    for i in 0..3 {
        let mut create = ExecuteRequest {
            collection: "logs".to_string(),
            ..execute(ExecuteOp::Create)
        };
        create.payload = Some(json!({"_id": format!("l{}", i), "n": i}));
        writer.execute(&create).unwrap();
    }

    let mut seqs = Vec::new();
    while seqs.len() < 3 {
        match stream.next_event(Duration::from_secs(2)).unwrap() {
            Some(event) => {
                assert_eq!(event["kind"], json!("insert"));
                seqs.push(event["seq"].as_u64().unwrap());
            }
            None => panic!("timed out waiting for change events"),
        }
    }
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}

#[test]
fn stats_cover_manager_and_engine() {
    let harness = harness();
    let mut client = client(&harness);

    client
        .call(OpCode::OpenDb, &json!({"project": "proj1"}))
        .unwrap();

    let (status, body) = client.call(OpCode::Stats, &json!({})).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(body["hot_engines"], json!(1));

    let (status, body) = client.call(OpCode::Stats, &json!({"project": "proj1"})).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(body["project"], json!("proj1"));
}

#[test]
fn validation_errors_carry_stable_codes() {
    let harness = harness();
    let mut client = client(&harness);
    client
        .call(OpCode::CreateCollection, &json!({"project": "proj1", "name": "users"}))
        .unwrap();

    // Bad filter operator
    let mut list = execute(ExecuteOp::List);
    list.options = Some(QueryBody {
        query: json!({"age": {"$regex": "x"}}),
        ..QueryBody::default()
    });
    let (status, body) = client.call(OpCode::Execute, &list).unwrap();
    assert_eq!(status, Status::Error);
    assert_eq!(body["code"], json!("validation/query"));

    // Duplicate collection
    let (status, body) = client
        .call(OpCode::CreateCollection, &json!({"project": "proj1", "name": "users"}))
        .unwrap();
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], json!("conflict/collection_exists"));
}
