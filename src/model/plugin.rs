use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NodeId;

/// Basic-auth credential presented when calling a plugin back.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Registration record of a discovery source.
///
/// Builtin records belong to the first-party backends: they have no
/// callback and cannot be deregistered.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRecord {
    pub id: Uuid,
    pub realm: NodeId,
    pub realm_name: String,
    pub callback: Option<String>,
    pub credential: Option<Credential>,
    pub builtin: bool,
}

impl PluginRecord {
    pub fn builtin(realm: NodeId, realm_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            realm,
            realm_name: realm_name.into(),
            callback: None,
            credential: None,
            builtin: true,
        }
    }
}
