//! Instance and challenge records plus the JSON payloads built from them.
//!
//! Field names on the wire follow the runner's public API
//! (`Instance_Id`, `Ports_Used`, ...), so every field carries an explicit
//! serde rename.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type InstanceId = u64;

/// Port tag used when a challenge does not say what a port speaks.
pub const DEFAULT_PORT_TYPE: &str = "nc";

/// One live or launching sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "Instance_Id")]
    pub instance_id: InstanceId,
    #[serde(rename = "Usr_Id")]
    pub user_id: String,
    #[serde(rename = "Challenge_Id")]
    pub challenge_id: String,
    #[serde(rename = "Portainer_Url")]
    pub backend_endpoint: String,
    /// Empty while the backend is still provisioning.
    #[serde(rename = "Portainer_Id")]
    pub backend_resource_id: String,
    /// Absolute deadline in Unix nanoseconds.
    #[serde(rename = "Instance_Timeout")]
    pub expiry_timestamp: i64,
    #[serde(rename = "Ports_Used")]
    pub ports_used: Vec<u16>,
}

impl Instance {
    pub fn is_provisioned(&self) -> bool {
        !self.backend_resource_id.is_empty()
    }
}

/// Template describing how to launch an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "Challenge_Id", default)]
    pub challenge_id: String,
    #[serde(rename = "Challenge_Name", default)]
    pub challenge_name: String,
    #[serde(rename = "Docker_Compose", default)]
    pub docker_compose: bool,
    #[serde(rename = "Port_Count", default)]
    pub port_count: usize,
    #[serde(rename = "Port_Types", default)]
    pub port_types: Vec<String>,

    // Single container
    #[serde(rename = "Internal_Port", default)]
    pub internal_port: u16,
    #[serde(rename = "Image_Name", default)]
    pub image_name: String,
    #[serde(rename = "Docker_Cmds", default)]
    pub docker_cmds: Vec<String>,

    // Compose stack
    #[serde(rename = "Docker_Compose_File", default)]
    pub docker_compose_file: String,
}

/// Stable challenge id derived from its name.
pub fn challenge_id_for(challenge_name: &str) -> String {
    hex::encode(Sha256::digest(challenge_name.as_bytes()))
}

/// Connection coordinates handed back by `/addInstance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedInstance {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Ports_Used")]
    pub ports_used: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    #[serde(rename = "Running_Instance")]
    pub running_instance: bool,
    /// False until the backend has returned a resource id.
    #[serde(rename = "Instance_Ready")]
    pub instance_ready: bool,
    #[serde(rename = "Challenge_Id")]
    pub challenge_id: String,
    /// Seconds until the instance is reclaimed.
    #[serde(rename = "Time_Left")]
    pub time_left: i64,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Ports_Used")]
    pub ports_used: Vec<u16>,
    #[serde(rename = "Port_Types")]
    pub port_types: Vec<String>,
}

/// Admin view of everything the runner knows about.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(rename = "Instance_Count")]
    pub instance_count: i64,
    #[serde(rename = "Challenge_Count")]
    pub challenge_count: usize,
    #[serde(rename = "Max_Instance_Count")]
    pub max_instance_count: usize,
    #[serde(rename = "Pending_Tasks")]
    pub pending_tasks: usize,
    #[serde(rename = "Endpoint_Loads")]
    pub endpoint_loads: BTreeMap<String, usize>,
    #[serde(rename = "Instances")]
    pub instances: Vec<Instance>,
    #[serde(rename = "Challenges")]
    pub challenges: Vec<Challenge>,
}
