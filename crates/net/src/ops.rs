//! Opcodes, statuses and JSON wire bodies.
//!
//! Frame payloads are JSON. Reply frames reuse the `flags` field to
//! carry the [`Status`]; an OK reply's payload is opcode-specific, an
//! error reply's payload is a [`WireError`] with a stable code and a
//! message that never leaks paths or pointers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use loam_core::{Error, IsolationLevel};
use loam_engine::PatchOp;
use loam_engine::Schema;

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    OpenDb = 1,
    CloseDb = 2,
    Execute = 3,
    Stats = 4,
    Batch = 5,
    CreateCollection = 6,
    DeleteCollection = 7,
    ListCollections = 8,
    Subscribe = 9,
    RequestVote = 10,
    AppendEntries = 11,
    Reply = 12,
    Error = 13,
}

impl OpCode {
    pub fn from_u16(raw: u16) -> Option<OpCode> {
        Some(match raw {
            1 => OpCode::OpenDb,
            2 => OpCode::CloseDb,
            3 => OpCode::Execute,
            4 => OpCode::Stats,
            5 => OpCode::Batch,
            6 => OpCode::CreateCollection,
            7 => OpCode::DeleteCollection,
            8 => OpCode::ListCollections,
            9 => OpCode::Subscribe,
            10 => OpCode::RequestVote,
            11 => OpCode::AppendEntries,
            12 => OpCode::Reply,
            13 => OpCode::Error,
            _ => return None,
        })
    }
}

/// Reply statuses, carried in the reply frame's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Conflict = 2,
    Error = 3,
    FrameTooLarge = 4,
    UnknownOpcode = 5,
}

impl Status {
    pub fn from_u16(raw: u16) -> Option<Status> {
        Some(match raw {
            0 => Status::Ok,
            1 => Status::NotFound,
            2 => Status::Conflict,
            3 => Status::Error,
            4 => Status::FrameTooLarge,
            5 => Status::UnknownOpcode,
            _ => return None,
        })
    }

    pub fn for_error(error: &Error) -> Status {
        if error.is_not_found() {
            Status::NotFound
        } else if error.is_conflict() {
            Status::Conflict
        } else {
            match error {
                Error::FrameTooLarge { .. } => Status::FrameTooLarge,
                Error::UnknownOpcode(_) => Status::UnknownOpcode,
                _ => Status::Error,
            }
        }
    }
}

/// Error reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn from_error(error: &Error) -> WireError {
        WireError {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Document operation sub-opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteOp {
    Create,
    Read,
    Update,
    Delete,
    Patch,
    List,
}

/// Sort/paging options of a find-query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueryBody {
    pub query: Value,
    pub sort_field: Option<String>,
    pub sort_desc: bool,
    pub limit: Option<usize>,
    pub skip: usize,
}

/// One document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub project: String,
    pub collection: String,
    pub op: ExecuteOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<PatchOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationLevel>,
}

/// Bodies of the collection-management opcodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBody {
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionBody {
    pub project: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeBody {
    pub project: String,
    #[serde(default)]
    pub buffer: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn opcode_roundtrip() {
        for raw in 1..=13u16 {
            let opcode = OpCode::from_u16(raw).unwrap();
            assert_eq!(opcode as u16, raw);
        }
        assert!(OpCode::from_u16(0).is_none());
        assert!(OpCode::from_u16(99).is_none());
    }

    #[test]
    fn status_maps_error_taxonomy() {
        assert_eq!(
            Status::for_error(&Error::CollectionNotFound("x".into())),
            Status::NotFound
        );
        assert_eq!(
            Status::for_error(&Error::CollectionExists("x".into())),
            Status::Conflict
        );
        assert_eq!(
            Status::for_error(&Error::UnknownOpcode(99)),
            Status::UnknownOpcode
        );
        assert_eq!(Status::for_error(&Error::EngineClosed), Status::Error);
    }

    #[test]
    fn execute_request_parses() {
        let request: ExecuteRequest = serde_json::from_value(json!({
            "project": "p1",
            "collection": "users",
            "op": "list",
            "options": {"query": {"age": {"$gt": 3}}, "limit": 5}
        }))
        .unwrap();
        assert_eq!(request.op, ExecuteOp::List);
        assert_eq!(request.options.unwrap().limit, Some(5));
    }

    #[test]
    fn unknown_body_fields_rejected() {
        let parsed: Result<ExecuteRequest, _> = serde_json::from_value(json!({
            "project": "p1",
            "collection": "users",
            "op": "read",
            "wat": 1
        }));
        assert!(parsed.is_err());
    }
}
