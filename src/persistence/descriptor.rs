//! Session descriptor file format.

use crate::client::ClientSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current descriptor format version.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Contents of `session.json`.
///
/// Client order is launch and save order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clients: Vec<ClientSpec>,
    #[serde(default)]
    pub trashed: Vec<ClientSpec>,
}

fn default_version() -> u32 {
    DESCRIPTOR_VERSION
}

impl SessionDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            name: name.to_string(),
            saved_at: None,
            clients: Vec::new(),
            trashed: Vec::new(),
        }
    }

    /// Parses and checks the version.
    pub fn parse(content: &str) -> Result<Self, String> {
        let descriptor: SessionDescriptor =
            serde_json::from_str(content).map_err(|e| e.to_string())?;
        if descriptor.version > DESCRIPTOR_VERSION {
            return Err(format!(
                "descriptor version {} is newer than supported version {}",
                descriptor.version, DESCRIPTOR_VERSION
            ));
        }
        Ok(descriptor)
    }
}
