//! Sea-query schema definitions for topology tables.

use sea_query::Iden;

/// Discovery tree nodes. Children point at their parent; deleting a node
/// cascades to its subtree.
#[derive(Iden)]
pub enum DiscoveryNodes {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "parent_id"]
    ParentId,
    #[iden = "name"]
    Name,
    #[iden = "node_type"]
    NodeType,
    /// JSON object of node labels.
    #[iden = "labels"]
    Labels,
    #[iden = "leaf"]
    Leaf,
}

/// Targets, one per leaf node.
#[derive(Iden)]
pub enum Targets {
    Table,
    #[iden = "node_id"]
    NodeId,
    #[iden = "connect_url"]
    ConnectUrl,
    #[iden = "alias"]
    Alias,
    #[iden = "jvm_id"]
    JvmId,
    #[iden = "labels"]
    Labels,
    #[iden = "platform_annotations"]
    PlatformAnnotations,
    #[iden = "cryostat_annotations"]
    CryostatAnnotations,
}

/// Plugin registrations. Each owns one realm node.
#[derive(Iden)]
pub enum DiscoveryPlugins {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "realm_id"]
    RealmId,
    #[iden = "realm_name"]
    RealmName,
    #[iden = "callback"]
    Callback,
    /// JSON-encoded credential, if any.
    #[iden = "credential"]
    Credential,
    #[iden = "builtin"]
    Builtin,
}
