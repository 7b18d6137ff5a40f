// cdp-proto: CDP wire protocol types and serialization.
//
// The session handshake uses bare frames (Hello, AuthRequest, AuthResponse).
// Everything after the handshake is framed inside a `Container` envelope,
// discriminated by a top-level `message_type` field.  Field names and shapes
// follow the upstream protocol.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node metadata
// ---------------------------------------------------------------------------

/// Kind of a node in the server's hierarchical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    System,
    Application,
    Component,
    Object,
    Message,
    BaseObject,
    Property,
    Setting,
    Enum,
    Operator,
    Node,
    UserType,
    #[default]
    Undefined,
}

/// Scalar type of a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Double,
    Float,
    Int64,
    Uint64,
    Int,
    Uint,
    Short,
    Ushort,
    Char,
    Uchar,
    Bool,
    String,
    #[default]
    Undefined,
}

/// Node flag bits carried in `NodeInfo::flags`.
pub mod node_flags {
    pub const NODE_IS_LEAF: u32 = 1;
    pub const VALUE_IS_READ_ONLY: u32 = 2;
}

/// Metadata for one node.
///
/// `node_id` is server-assigned and may change across server restarts; only
/// the (parent path, name) pair is stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: u32,
    pub name: String,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub flags: u32,
    /// Set on the application child that represents the serving application
    /// itself in a system structure response.
    #[serde(default)]
    pub is_local: bool,
}

impl NodeInfo {
    pub fn is_leaf(&self) -> bool {
        self.flags & node_flags::NODE_IS_LEAF != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & node_flags::VALUE_IS_READ_ONLY != 0
    }
}

/// One node of a structure response: metadata plus direct children.
///
/// Children carry metadata only; their own subtrees are fetched with
/// separate structure requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStructure {
    pub info: NodeInfo,
    #[serde(default, rename = "node")]
    pub children: Vec<NodeStructure>,
}

// ---------------------------------------------------------------------------
// Variant values
// ---------------------------------------------------------------------------

/// A tagged scalar carried in getter/setter messages.
///
/// Exactly one of the `*_value` fields is populated; which one is determined
/// by the target node's `ValueType`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariantValue {
    pub node_id: u32,
    /// Server clock domain, nanoseconds.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f_value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i64_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui64_value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_value: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_value: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub us_value: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_value: Option<i8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uc_value: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str_value: Option<String>,
}

// ---------------------------------------------------------------------------
// Handshake frames (outside the container envelope)
// ---------------------------------------------------------------------------

/// The server's opening frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hello {
    pub system_name: String,
    #[serde(default)]
    pub application_name: String,
    pub compat_version: u32,
    #[serde(default)]
    pub incremental_version: u32,
    #[serde(default)]
    pub cdp_version_major: u32,
    #[serde(default)]
    pub cdp_version_minor: u32,
    #[serde(default)]
    pub cdp_version_patch: u32,
    /// Opaque nonce; empty when the server requires no authentication.
    #[serde(default)]
    pub challenge: Vec<u8>,
    #[serde(default)]
    pub system_use_notification: String,
}

/// One challenge response inside an `AuthRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Response scheme, e.g. `"PasswordHash"`.
    #[serde(rename = "type")]
    pub response_type: String,
    /// Raw digest bytes.
    pub response: Vec<u8>,
}

/// Client credentials frame, sent bare during the handshake or wrapped in a
/// `Container::ReAuthRequest` after session establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// As typed by the user; lower-casing happens only inside the hash.
    pub user_id: String,
    pub challenge_response: Vec<ChallengeResponse>,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthResultCode {
    CredentialsRequired = 0,
    Granted = 1,
    GrantedPasswordWillExpireSoon = 2,
    NewPasswordRequired = 10,
    InvalidChallengeResponse = 11,
    AdditionalResponseRequired = 12,
    TemporarilyBlocked = 13,
    ReauthenticationRequired = 14,
}

impl AuthResultCode {
    /// Whether this result code grants access to the session.
    pub fn is_granted(self) -> bool {
        matches!(
            self,
            AuthResultCode::Granted | AuthResultCode::GrantedPasswordWillExpireSoon
        )
    }
}

/// Server reply to an `AuthRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub result_code: AuthResultCode,
    #[serde(default)]
    pub result_text: String,
    /// Names of additional credential fields the server wants on the next
    /// attempt (e.g. a new password).
    #[serde(default)]
    pub additional_challenge_response_required: Vec<String>,
}

// ---------------------------------------------------------------------------
// Container messages
// ---------------------------------------------------------------------------

/// Request the subtree of each listed node; an empty list requests the
/// root/system structure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructureRequest {
    #[serde(default)]
    pub node_ids: Vec<u32>,
}

/// One `NodeStructure` per requested node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureResponse {
    pub structures: Vec<NodeStructure>,
}

/// One value subscription start/stop entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRequest {
    pub node_id: u32,
    /// Sample-frequency hint, protocol-prescribed.
    pub fs: f64,
    #[serde(default)]
    pub stop: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetterRequest {
    pub requests: Vec<ValueRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetterResponse {
    pub variants: Vec<VariantValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetterRequest {
    pub variants: Vec<VariantValue>,
}

/// Ids of nodes whose structure changed server-side; the client re-requests
/// each one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureChangeResponse {
    pub node_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CurrentTimeRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTimeResponse {
    /// Server wall clock, nanoseconds since the Unix epoch.
    pub server_time_ns: u64,
}

/// Remote error codes observed on the wire.
pub mod remote_error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNSUPPORTED_CONTAINER_TYPE: &str = "UNSUPPORTED_CONTAINER_TYPE";
    pub const AUTH_RESPONSE_EXPIRED: &str = "AUTH_RESPONSE_EXPIRED";
}

/// Server-side error report.
///
/// `AUTH_RESPONSE_EXPIRED` carries a fresh `challenge` for the re-auth
/// round; the other codes leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// One of [`remote_error_codes`].
    pub code: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub challenge: Vec<u8>,
}

/// The post-handshake envelope.
///
/// Serializes with a `message_type` tag:
///
/// ```json
/// { "message_type": "structure_request", "node_ids": [5] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
#[serde(rename_all = "snake_case")]
pub enum Container {
    StructureRequest(StructureRequest),
    StructureResponse(StructureResponse),
    GetterRequest(GetterRequest),
    GetterResponse(GetterResponse),
    SetterRequest(SetterRequest),
    StructureChangeResponse(StructureChangeResponse),
    CurrentTimeRequest(CurrentTimeRequest),
    CurrentTimeResponse(CurrentTimeResponse),
    ReAuthRequest(AuthRequest),
    ReAuthResponse(AuthResponse),
    RemoteError(RemoteError),
}
