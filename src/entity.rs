use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Capability contract satisfied by every record kind the store can manage.
///
/// Entities are dumb carriers: the store persists the state-machine fields
/// exactly as given and never validates transition legality. Implementors
/// must round-trip through serde without loss, since the storage boundary
/// serializes the whole entity as a JSON document.
pub trait StateEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable kind name, used to derive table names for this entity.
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn state(&self) -> i32;
    fn state_count(&self) -> u32;
    /// Epoch millis at which the record becomes eligible for selection again.
    fn state_timestamp(&self) -> i64;
    fn created_at(&self) -> i64;
    fn updated_at(&self) -> i64;
    fn error_detail(&self) -> Option<&str>;

    /// Refresh `updated_at`. Called by the store on every save.
    fn touch(&mut self, now_ms: i64);
}

/// Position of a [`DataFlow`] in its processing state machine.
///
/// Codes are spaced out so deployments can introduce intermediate states
/// without renumbering. The store itself only ever sees the raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DataFlowState {
    NotStarted = 0,
    Started = 100,
    Completed = 200,
    Failed = 300,
}

impl DataFlowState {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            100 => Some(Self::Started),
            200 => Some(Self::Completed),
            300 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Pointer to a data endpoint, identified by a transport `type` plus
/// free-form properties (credentials, URLs, paths).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataAddress {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A single data-transfer flow tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    pub id: String,
    pub state: i32,
    #[serde(default)]
    pub state_count: u32,
    #[serde(default)]
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Distributed tracing propagation headers, opaque to the store.
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub source: DataAddress,
    pub destination: DataAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_address: Option<String>,
    #[serde(default)]
    pub trackable: bool,
}

impl DataFlow {
    pub fn new(id: impl Into<String>, source: DataAddress, destination: DataAddress, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            state: DataFlowState::NotStarted.code(),
            state_count: 0,
            state_timestamp: now_ms,
            created_at: now_ms,
            updated_at: now_ms,
            error_detail: None,
            trace_context: HashMap::new(),
            properties: HashMap::new(),
            source,
            destination,
            callback_address: None,
            trackable: false,
        }
    }

    /// Advance the state machine. Re-entering the current state bumps the
    /// attempt counter; moving to a new state resets it. Clears any previous
    /// error detail; callers record failures via [`DataFlow::transition_failed`].
    pub fn transition_to(&mut self, state: i32, now_ms: i64) {
        if state == self.state {
            self.state_count += 1;
        } else {
            self.state = state;
            self.state_count = 1;
        }
        self.state_timestamp = now_ms;
        self.error_detail = None;
    }

    pub fn transition_failed(&mut self, detail: impl Into<String>, now_ms: i64) {
        self.transition_to(DataFlowState::Failed.code(), now_ms);
        self.error_detail = Some(detail.into());
    }
}

impl StateEntity for DataFlow {
    const KIND: &'static str = "data_flow";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i32 {
        self.state
    }
    fn state_count(&self) -> u32 {
        self.state_count
    }
    fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }
    fn touch(&mut self, now_ms: i64) {
        self.updated_at = now_ms;
    }
}

/// A registered data-plane instance and its capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPlaneInstance {
    pub id: String,
    pub state: i32,
    #[serde(default)]
    pub state_count: u32,
    #[serde(default)]
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub url: String,
    #[serde(default)]
    pub allowed_source_types: Vec<String>,
    #[serde(default)]
    pub allowed_dest_types: Vec<String>,
    #[serde(default)]
    pub last_active: i64,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl DataPlaneInstance {
    pub fn new(id: impl Into<String>, url: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            state: 0,
            state_count: 0,
            state_timestamp: now_ms,
            created_at: now_ms,
            updated_at: now_ms,
            error_detail: None,
            url: url.into(),
            allowed_source_types: Vec::new(),
            allowed_dest_types: Vec::new(),
            last_active: now_ms,
            turn_count: 0,
            properties: HashMap::new(),
        }
    }

    /// Whether this instance can serve a transfer between the given
    /// source/destination address types.
    pub fn can_handle(&self, source_type: &str, dest_type: &str) -> bool {
        self.allowed_source_types.iter().any(|t| t == source_type)
            && self.allowed_dest_types.iter().any(|t| t == dest_type)
    }
}

impl StateEntity for DataPlaneInstance {
    const KIND: &'static str = "data_plane_instance";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i32 {
        self.state
    }
    fn state_count(&self) -> u32 {
        self.state_count
    }
    fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }
    fn touch(&mut self, now_ms: i64) {
        self.updated_at = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            DataFlowState::NotStarted,
            DataFlowState::Started,
            DataFlowState::Completed,
            DataFlowState::Failed,
        ] {
            assert_eq!(DataFlowState::from_code(state.code()), Some(state));
        }
        assert_eq!(DataFlowState::from_code(42), None);
    }

    #[test]
    fn test_transition_bumps_count_on_reentry() {
        let mut flow = DataFlow::new("f1", DataAddress::new("s3"), DataAddress::new("blob"), 1000);
        assert_eq!(flow.state, DataFlowState::NotStarted.code());

        flow.transition_to(DataFlowState::Started.code(), 2000);
        assert_eq!(flow.state_count, 1);
        assert_eq!(flow.state_timestamp, 2000);

        // Re-entering the same state counts as another attempt
        flow.transition_to(DataFlowState::Started.code(), 3000);
        assert_eq!(flow.state_count, 2);

        flow.transition_to(DataFlowState::Completed.code(), 4000);
        assert_eq!(flow.state_count, 1);
    }

    #[test]
    fn test_transition_clears_error_detail() {
        let mut flow = DataFlow::new("f1", DataAddress::new("s3"), DataAddress::new("blob"), 0);
        flow.transition_failed("connection refused", 100);
        assert_eq!(flow.state, DataFlowState::Failed.code());
        assert_eq!(flow.error_detail.as_deref(), Some("connection refused"));

        flow.transition_to(DataFlowState::Started.code(), 200);
        assert!(flow.error_detail.is_none());
    }

    #[test]
    fn test_data_address_serializes_type_field() {
        let address = DataAddress::new("s3").with_property("region", "eu-west-1");
        let json = serde_json::to_value(&address).unwrap();
        assert_eq!(json["type"], "s3");
        assert_eq!(json["properties"]["region"], "eu-west-1");

        let back: DataAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, address);
    }

    #[test]
    fn test_instance_capability_check() {
        let mut instance = DataPlaneInstance::new("dp1", "http://localhost:8080/control", 0);
        instance.allowed_source_types = vec!["s3".into(), "http".into()];
        instance.allowed_dest_types = vec!["blob".into()];

        assert!(instance.can_handle("s3", "blob"));
        assert!(!instance.can_handle("s3", "kafka"));
        assert!(!instance.can_handle("ftp", "blob"));
    }
}
