//! Wire message types.
//!
//! Every frame is one JSON-encoded [`Message`]. The envelope is adjacently
//! tagged (`{"type": ..., "body": ...}`) so frames stay self-describing and
//! readable in packet dumps.

use crate::error::{NetworkError, Result};
use crate::partitioning::{Ring, RingNode};
use crate::security::Signable;
use crate::storage::Record;
use crate::types::{HashRange, Partition};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Top-level message exchanged between clients, nodes and the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    /// First message on every connection, names the peer.
    Identification(Identification),

    /// Client request or node response.
    Kv(KvMessage),

    /// A client write forwarded by its primary to a replica.
    Replication(ReplicationEnvelope),

    /// Coordinator command or its acknowledgement.
    Control(ClusterControl),

    /// Ring request (no ring) or ring snapshot.
    MetadataUpdate(MetadataUpdate),

    /// Bulk record movement between nodes.
    DataTransfer(DataTransfer),
}

/// Names the sender of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub client_id: String,
}

/// Request and response statuses for key-value traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusType {
    Get,
    Put,
    Subscribe,
    Unsubscribe,
    GetSuccess,
    GetError,
    PutSuccess,
    PutUpdate,
    PutError,
    DeleteSuccess,
    DeleteError,
    SubscribeSuccess,
    SubscribeError,
    UnsubscribeSuccess,
    UnsubscribeError,
    Notify,
    Failed,
    AuthFailed,
    NotResponsible,
    ServerStopped,
    ServerWriteLock,
}

impl StatusType {
    /// Check if this is a request status.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            StatusType::Get | StatusType::Put | StatusType::Subscribe | StatusType::Unsubscribe
        )
    }

    /// Check if this is a mutating request status.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatusType::Put | StatusType::Subscribe | StatusType::Unsubscribe
        )
    }

    /// Check if a response status reports an applied mutation.
    pub fn is_write_success(&self) -> bool {
        matches!(
            self,
            StatusType::PutSuccess
                | StatusType::PutUpdate
                | StatusType::DeleteSuccess
                | StatusType::SubscribeSuccess
                | StatusType::UnsubscribeSuccess
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            StatusType::Get => "GET",
            StatusType::Put => "PUT",
            StatusType::Subscribe => "SUBSCRIBE",
            StatusType::Unsubscribe => "UNSUBSCRIBE",
            StatusType::GetSuccess => "GET_SUCCESS",
            StatusType::GetError => "GET_ERROR",
            StatusType::PutSuccess => "PUT_SUCCESS",
            StatusType::PutUpdate => "PUT_UPDATE",
            StatusType::PutError => "PUT_ERROR",
            StatusType::DeleteSuccess => "DELETE_SUCCESS",
            StatusType::DeleteError => "DELETE_ERROR",
            StatusType::SubscribeSuccess => "SUBSCRIBE_SUCCESS",
            StatusType::SubscribeError => "SUBSCRIBE_ERROR",
            StatusType::UnsubscribeSuccess => "UNSUBSCRIBE_SUCCESS",
            StatusType::UnsubscribeError => "UNSUBSCRIBE_ERROR",
            StatusType::Notify => "NOTIFY",
            StatusType::Failed => "FAILED",
            StatusType::AuthFailed => "AUTH_FAILED",
            StatusType::NotResponsible => "NOT_RESPONSIBLE",
            StatusType::ServerStopped => "SERVER_STOPPED",
            StatusType::ServerWriteLock => "SERVER_WRITE_LOCK",
        }
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key-value request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvMessage {
    pub key: String,

    /// `None` on a PUT means delete.
    #[serde(default)]
    pub value: Option<String>,

    /// Identity of the client that issued the request.
    pub client_id: String,

    pub status: StatusType,

    /// Unique per request; makes otherwise identical requests sign differently.
    pub request_id: Uuid,

    /// Hex signature by the client key over [`Signable::signing_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Current ring, attached to NOT_RESPONSIBLE responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Ring>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl KvMessage {
    /// Build an unsigned request.
    pub fn request(
        status: StatusType,
        key: impl Into<String>,
        value: Option<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            client_id: client_id.into(),
            status,
            request_id: Uuid::new_v4(),
            tag: None,
            metadata: None,
            error_message: None,
        }
    }

    /// Build the response to this request, keeping key and request id.
    pub fn respond(&self, status: StatusType) -> Self {
        Self {
            key: self.key.clone(),
            value: None,
            client_id: self.client_id.clone(),
            status,
            request_id: self.request_id,
            tag: None,
            metadata: None,
            error_message: None,
        }
    }

    /// Attach a value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Attach the ring.
    pub fn with_metadata(mut self, ring: Ring) -> Self {
        self.metadata = Some(ring);
        self
    }

    /// Attach an error description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// A PUT without a value.
    pub fn is_delete(&self) -> bool {
        self.status == StatusType::Put && self.value.is_none()
    }
}

impl Signable for KvMessage {
    fn signing_payload(&self) -> Vec<u8> {
        // A missing value encodes as null, so a delete never signs like an
        // empty PUT.
        serde_json::to_vec(&(
            self.status,
            &self.key,
            &self.value,
            &self.client_id,
            self.request_id,
        ))
        .unwrap_or_default()
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn set_tag(&mut self, tag: String) {
        self.tag = Some(tag);
    }
}

/// A client write forwarded to a replica, signed by the original client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub message: KvMessage,
}

/// Coordinator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Init,
    Start,
    Stop,
    Shutdown,
    LockWrite,
    UnlockWrite,
    MoveData,
    UpdateMetadata,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlAction::Init => "INIT",
            ControlAction::Start => "START",
            ControlAction::Stop => "STOP",
            ControlAction::Shutdown => "SHUTDOWN",
            ControlAction::LockWrite => "LOCK_WRITE",
            ControlAction::UnlockWrite => "UNLOCK_WRITE",
            ControlAction::MoveData => "MOVE_DATA",
            ControlAction::UpdateMetadata => "UPDATE_METADATA",
        };
        f.write_str(s)
    }
}

/// Outcome reported in a control acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failure,
}

/// A coordinator command, signed with the coordinator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterControl {
    pub action: ControlAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Ring>,

    /// Destination of a MOVE_DATA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<RingNode>,

    /// Range moved by a MOVE_DATA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_range: Option<HashRange>,

    pub sender_id: String,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Makes two commands issued in the same millisecond sign differently.
    pub nonce: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Set on acknowledgements only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
}

impl ClusterControl {
    /// Build an unsigned command.
    pub fn new(action: ControlAction, sender_id: impl Into<String>) -> Self {
        Self {
            action,
            metadata: None,
            target_node: None,
            hash_range: None,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            nonce: Uuid::new_v4(),
            tag: None,
            status: None,
        }
    }

    /// Attach a ring.
    pub fn with_metadata(mut self, ring: Ring) -> Self {
        self.metadata = Some(ring);
        self
    }

    /// Attach a MOVE_DATA destination and range.
    pub fn with_move(mut self, target: RingNode, range: HashRange) -> Self {
        self.target_node = Some(target);
        self.hash_range = Some(range);
        self
    }

    /// Build the acknowledgement for this command.
    pub fn acknowledge(&self, status: ActionStatus) -> Self {
        Self {
            action: self.action,
            metadata: None,
            target_node: None,
            hash_range: None,
            sender_id: self.sender_id.clone(),
            timestamp: now_millis(),
            nonce: self.nonce,
            tag: None,
            status: Some(status),
        }
    }
}

impl Signable for ClusterControl {
    fn signing_payload(&self) -> Vec<u8> {
        // Tuple serialization is field-order stable and skips tag and status.
        serde_json::to_vec(&(
            self.action,
            &self.metadata,
            &self.target_node,
            &self.hash_range,
            &self.sender_id,
            self.timestamp,
            self.nonce,
        ))
        .unwrap_or_default()
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn set_tag(&mut self, tag: String) {
        self.tag = Some(tag);
    }
}

/// Ring request (`ring == None`) or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<Ring>,
    pub request_id: Uuid,
}

/// Kinds of data-transfer exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    /// Insert the payload into the given partition.
    Request,
    Success,
    Failure,
    /// Relabel records in range from replica-1 to replica-2.
    MoveReplica1ToReplica2,
    /// Relabel records in range from replica-2 to replica-1.
    MoveReplica2ToReplica1,
    /// Drop records in range from the given partition.
    DeleteData,
}

/// Bulk record movement between nodes.
///
/// `authorization` carries the coordinator-signed command that caused the
/// transfer: the MOVE_DATA itself, or the UPDATE_METADATA whose ring change
/// triggered replica reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransfer {
    pub kind: TransferKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Record>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_range: Option<HashRange>,

    pub partition: Partition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<ClusterControl>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DataTransfer {
    /// Build a transfer of the given kind.
    pub fn new(kind: TransferKind, partition: Partition) -> Self {
        Self {
            kind,
            payload: Vec::new(),
            hash_range: None,
            partition,
            authorization: None,
            message: None,
        }
    }

    /// Attach records.
    pub fn with_payload(mut self, payload: Vec<Record>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a range.
    pub fn with_range(mut self, range: HashRange) -> Self {
        self.hash_range = Some(range);
        self
    }

    /// Attach the authorizing command.
    pub fn with_authorization(mut self, control: Option<ClusterControl>) -> Self {
        self.authorization = control;
        self
    }

    /// Build a SUCCESS or FAILURE reply.
    pub fn reply(&self, ok: bool, message: Option<String>) -> Self {
        Self {
            kind: if ok {
                TransferKind::Success
            } else {
                TransferKind::Failure
            },
            payload: Vec::new(),
            hash_range: self.hash_range,
            partition: self.partition,
            authorization: None,
            message,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| NetworkError::Serialization(e.to_string()).into())
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    serde_json::from_slice(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::security::MessageSigner;

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&StatusType::ServerWriteLock).unwrap();
        assert_eq!(json, "\"SERVER_WRITE_LOCK\"");
        assert_eq!(StatusType::NotResponsible.to_string(), "NOT_RESPONSIBLE");
    }

    #[test]
    fn test_envelope_is_tagged() {
        let msg = Message::Identification(Identification {
            client_id: "c1".to_string(),
        });
        let json = String::from_utf8(encode_message(&msg).unwrap()).unwrap();
        assert!(json.contains("\"type\":\"identification\""));
        assert_eq!(decode_message(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message(b"{\"type\":\"nope\"}").is_err());
        assert!(decode_message(b"not json").is_err());
    }

    #[test]
    fn test_empty_put_does_not_sign_as_delete() {
        let signer = MessageSigner::development_client();
        let verifier = signer.verifier();
        let mut empty = KvMessage::request(StatusType::Put, "k", Some(String::new()), "c1");
        signer.sign(&mut empty);
        assert!(verifier.verify(&empty).is_ok());

        let mut delete = empty.clone();
        delete.value = None;
        assert!(delete.is_delete());
        assert_ne!(delete.signing_payload(), empty.signing_payload());
        assert_eq!(verifier.verify(&delete), Err(AuthError::BadSignature));

        // Separator bytes inside a field must not move the field boundary.
        let mut joined = KvMessage::request(StatusType::Put, "k\u{1f}a", Some("b".into()), "c1");
        let split = KvMessage {
            key: "k".into(),
            value: Some("a\u{1f}b".into()),
            ..joined.clone()
        };
        assert_ne!(joined.signing_payload(), split.signing_payload());
        signer.sign(&mut joined);
        let forged = KvMessage {
            tag: joined.tag.clone(),
            ..split
        };
        assert_eq!(verifier.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_kv_signature_covers_value() {
        let signer = MessageSigner::development_client();
        let mut msg = KvMessage::request(StatusType::Put, "k", Some("v".into()), "c1");
        signer.sign(&mut msg);
        let verifier = signer.verifier();
        assert!(verifier.verify(&msg).is_ok());

        let mut tampered = msg.clone();
        tampered.value = Some("w".into());
        assert!(verifier.verify(&tampered).is_err());

        let mut as_delete = msg.clone();
        as_delete.value = None;
        assert!(verifier.verify(&as_delete).is_err());
    }

    #[test]
    fn test_control_signature_survives_wire() {
        let signer = MessageSigner::development_ecs();
        let mut ring = Ring::new();
        ring.place(RingNode::new("a", "127.0.0.1", 1));
        let mut ctrl = ClusterControl::new(ControlAction::UpdateMetadata, "ecs").with_metadata(ring);
        signer.sign(&mut ctrl);

        let wire = encode_message(&Message::Control(ctrl)).unwrap();
        match decode_message(&wire).unwrap() {
            Message::Control(back) => assert!(signer.verifier().verify(&back).is_ok()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_respond_keeps_request_id() {
        let req = KvMessage::request(StatusType::Get, "k", None, "c1");
        let resp = req.respond(StatusType::GetError);
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(resp.key, "k");
        assert!(resp.tag.is_none());
    }
}
