//! SQLite implementation of TopologyStore.

use async_trait::async_trait;
use sea_query::{Alias, Expr, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::schema::{DiscoveryNodes, DiscoveryPlugins, Targets};
use crate::model::{Annotations, Labels, NodeId, NodeRecord, NodeType, PluginRecord, Target};
use crate::storage::{Result, StorageError, TopologyStore, TopologyTxn};

/// Columns shared by every node query; target columns are NULL for
/// non-leaf nodes.
const SUBTREE_TARGETS_SQL: &str = "
    WITH RECURSIVE subtree(id) AS (
        SELECT id FROM discovery_nodes WHERE id = ?1
        UNION ALL
        SELECT n.id FROM discovery_nodes n JOIN subtree s ON n.parent_id = s.id
    )
    SELECT n.id, n.parent_id, n.name, n.node_type, n.labels, n.leaf,
           t.connect_url, t.alias, t.jvm_id, t.platform_annotations,
           t.cryostat_annotations, t.labels AS target_labels
    FROM discovery_nodes n
    JOIN targets t ON t.node_id = n.id
    WHERE n.id IN (SELECT id FROM subtree)
    ORDER BY n.rowid";

/// SQLite-backed topology store.
pub struct SqliteTopologyStore {
    pool: SqlitePool,
}

impl SqliteTopologyStore {
    /// Create a new SQLite topology store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TopologyStore for SqliteTopologyStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS discovery_nodes (
                id TEXT PRIMARY KEY,
                parent_id TEXT REFERENCES discovery_nodes(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                node_type TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                leaf INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_discovery_nodes_parent ON discovery_nodes(parent_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS targets (
                node_id TEXT PRIMARY KEY REFERENCES discovery_nodes(id) ON DELETE CASCADE,
                connect_url TEXT NOT NULL UNIQUE,
                alias TEXT NOT NULL UNIQUE,
                jvm_id TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                platform_annotations TEXT NOT NULL DEFAULT '{}',
                cryostat_annotations TEXT NOT NULL DEFAULT '{}'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS discovery_plugins (
                id TEXT PRIMARY KEY,
                realm_id TEXT NOT NULL REFERENCES discovery_nodes(id) ON DELETE CASCADE,
                realm_name TEXT NOT NULL,
                callback TEXT,
                credential TEXT,
                builtin INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn TopologyTxn>> {
        // Take the write lock up front: a deferred transaction that upgrades
        // from read to write fails with SQLITE_BUSY without waiting.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTxn { tx }))
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        let query = node_select().to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(decode_node).collect()
    }

    async fn plugin_records(&self) -> Result<Vec<PluginRecord>> {
        let query = plugin_select().to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(decode_plugin).collect()
    }
}

struct SqliteTxn {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteTxn {
    async fn fetch_nodes(&mut self, query: String) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_node).collect()
    }

    async fn fetch_node(&mut self, query: String) -> Result<Option<NodeRecord>> {
        Ok(self.fetch_nodes(query).await?.into_iter().next())
    }
}

#[async_trait]
impl TopologyTxn for SqliteTxn {
    async fn root(&mut self) -> Result<Option<NodeRecord>> {
        let query = node_select()
            .and_where(Expr::col((DiscoveryNodes::Table, DiscoveryNodes::ParentId)).is_null())
            .and_where(
                Expr::col((DiscoveryNodes::Table, DiscoveryNodes::NodeType))
                    .eq(NodeType::Universe.as_str()),
            )
            .to_string(SqliteQueryBuilder);
        self.fetch_node(query).await
    }

    async fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>> {
        let query = node_select()
            .and_where(Expr::col((DiscoveryNodes::Table, DiscoveryNodes::Id)).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        self.fetch_node(query).await
    }

    async fn children(&mut self, parent: NodeId) -> Result<Vec<NodeRecord>> {
        let query = node_select()
            .and_where(
                Expr::col((DiscoveryNodes::Table, DiscoveryNodes::ParentId)).eq(parent.to_string()),
            )
            .to_string(SqliteQueryBuilder);
        self.fetch_nodes(query).await
    }

    async fn insert_node(&mut self, node: &NodeRecord) -> Result<()> {
        match node.parent {
            Some(parent) => {
                let parent_node = self
                    .node(parent)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(format!("parent node {}", parent)))?;
                if parent_node.leaf {
                    return Err(StorageError::Conflict(format!(
                        "leaf node {} cannot have children",
                        parent
                    )));
                }
            }
            None => {
                if node.node_type != NodeType::Universe || self.root().await?.is_some() {
                    return Err(StorageError::Conflict(
                        "only a single Universe node may be parentless".to_string(),
                    ));
                }
            }
        }

        let insert = Query::insert()
            .into_table(DiscoveryNodes::Table)
            .columns([
                DiscoveryNodes::Id,
                DiscoveryNodes::ParentId,
                DiscoveryNodes::Name,
                DiscoveryNodes::NodeType,
                DiscoveryNodes::Labels,
                DiscoveryNodes::Leaf,
            ])
            .values_panic([
                node.id.to_string().into(),
                node.parent.map(|p| p.to_string()).into(),
                node.name.clone().into(),
                node.node_type.as_str().into(),
                serde_json::to_string(&node.labels)?.into(),
                i64::from(node.leaf).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert).execute(&mut *self.tx).await?;

        if let Some(target) = &node.target {
            let insert = Query::insert()
                .into_table(Targets::Table)
                .columns([
                    Targets::NodeId,
                    Targets::ConnectUrl,
                    Targets::Alias,
                    Targets::JvmId,
                    Targets::Labels,
                    Targets::PlatformAnnotations,
                    Targets::CryostatAnnotations,
                ])
                .values_panic([
                    node.id.to_string().into(),
                    target.connect_url.clone().into(),
                    target.alias.clone().into(),
                    target.jvm_id.clone().into(),
                    serde_json::to_string(&target.labels)?.into(),
                    serde_json::to_string(&target.annotations.platform)?.into(),
                    serde_json::to_string(&target.annotations.cryostat)?.into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&insert).execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_labels(&mut self, id: NodeId, labels: &Labels) -> Result<()> {
        let update = Query::update()
            .table(DiscoveryNodes::Table)
            .value(DiscoveryNodes::Labels, serde_json::to_string(labels)?)
            .and_where(Expr::col(DiscoveryNodes::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&update).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    async fn update_target(&mut self, id: NodeId, target: &Target) -> Result<()> {
        let previous = self
            .node(id)
            .await?
            .and_then(|n| n.target)
            .ok_or_else(|| StorageError::NotFound(format!("target node {}", id)))?;
        if previous.connect_url != target.connect_url {
            return Err(StorageError::Conflict(
                "a target's connect URL cannot change".to_string(),
            ));
        }

        let update = Query::update()
            .table(Targets::Table)
            .value(Targets::Alias, target.alias.clone())
            .value(Targets::JvmId, target.jvm_id.clone())
            .value(Targets::Labels, serde_json::to_string(&target.labels)?)
            .value(
                Targets::PlatformAnnotations,
                serde_json::to_string(&target.annotations.platform)?,
            )
            .value(
                Targets::CryostatAnnotations,
                serde_json::to_string(&target.annotations.cryostat)?,
            )
            .and_where(Expr::col(Targets::NodeId).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&update).execute(&mut *self.tx).await?;

        let update = Query::update()
            .table(DiscoveryNodes::Table)
            .value(DiscoveryNodes::Name, target.alias.clone())
            .value(DiscoveryNodes::Labels, serde_json::to_string(&target.labels)?)
            .and_where(Expr::col(DiscoveryNodes::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&update).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let delete = Query::delete()
            .from_table(DiscoveryNodes::Table)
            .and_where(Expr::col(DiscoveryNodes::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&delete).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    async fn node_by_url(&mut self, connect_url: &str) -> Result<Option<NodeRecord>> {
        let query = node_select()
            .and_where(Expr::col((Targets::Table, Targets::ConnectUrl)).eq(connect_url))
            .to_string(SqliteQueryBuilder);
        self.fetch_node(query).await
    }

    async fn node_by_alias(&mut self, alias: &str) -> Result<Option<NodeRecord>> {
        let query = node_select()
            .and_where(Expr::col((Targets::Table, Targets::Alias)).eq(alias))
            .to_string(SqliteQueryBuilder);
        self.fetch_node(query).await
    }

    async fn targets_under(&mut self, root: NodeId) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(SUBTREE_TARGETS_SQL)
            .bind(root.to_string())
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(decode_node).collect()
    }

    async fn plugins(&mut self) -> Result<Vec<PluginRecord>> {
        let query = plugin_select().to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_plugin).collect()
    }

    async fn plugin(&mut self, id: Uuid) -> Result<Option<PluginRecord>> {
        let query = plugin_select()
            .and_where(Expr::col(DiscoveryPlugins::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(decode_plugin).transpose()
    }

    async fn insert_plugin(&mut self, plugin: &PluginRecord) -> Result<()> {
        let credential = plugin
            .credential
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let insert = Query::insert()
            .into_table(DiscoveryPlugins::Table)
            .columns([
                DiscoveryPlugins::Id,
                DiscoveryPlugins::RealmId,
                DiscoveryPlugins::RealmName,
                DiscoveryPlugins::Callback,
                DiscoveryPlugins::Credential,
                DiscoveryPlugins::Builtin,
            ])
            .values_panic([
                plugin.id.to_string().into(),
                plugin.realm.to_string().into(),
                plugin.realm_name.clone().into(),
                plugin.callback.clone().into(),
                credential.into(),
                i64::from(plugin.builtin).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_plugin(&mut self, id: Uuid) -> Result<()> {
        let delete = Query::delete()
            .from_table(DiscoveryPlugins::Table)
            .and_where(Expr::col(DiscoveryPlugins::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&delete).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("plugin {}", id)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn node_select() -> SelectStatement {
    Query::select()
        .columns([
            (DiscoveryNodes::Table, DiscoveryNodes::Id),
            (DiscoveryNodes::Table, DiscoveryNodes::ParentId),
            (DiscoveryNodes::Table, DiscoveryNodes::Name),
            (DiscoveryNodes::Table, DiscoveryNodes::NodeType),
            (DiscoveryNodes::Table, DiscoveryNodes::Labels),
            (DiscoveryNodes::Table, DiscoveryNodes::Leaf),
        ])
        .columns([
            (Targets::Table, Targets::ConnectUrl),
            (Targets::Table, Targets::Alias),
            (Targets::Table, Targets::JvmId),
            (Targets::Table, Targets::PlatformAnnotations),
            (Targets::Table, Targets::CryostatAnnotations),
        ])
        .expr_as(
            Expr::col((Targets::Table, Targets::Labels)),
            Alias::new("target_labels"),
        )
        .from(DiscoveryNodes::Table)
        .left_join(
            Targets::Table,
            Expr::col((Targets::Table, Targets::NodeId))
                .equals((DiscoveryNodes::Table, DiscoveryNodes::Id)),
        )
        .order_by_expr(Expr::cust("discovery_nodes.rowid"), Order::Asc)
        .to_owned()
}

fn plugin_select() -> SelectStatement {
    Query::select()
        .columns([
            DiscoveryPlugins::Id,
            DiscoveryPlugins::RealmId,
            DiscoveryPlugins::RealmName,
            DiscoveryPlugins::Callback,
            DiscoveryPlugins::Credential,
            DiscoveryPlugins::Builtin,
        ])
        .from(DiscoveryPlugins::Table)
        .order_by_expr(Expr::cust("rowid"), Order::Asc)
        .to_owned()
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_map(raw: &str) -> Result<Labels> {
    Ok(serde_json::from_str(raw)?)
}

fn decode_node(row: &SqliteRow) -> Result<NodeRecord> {
    let id: String = row.try_get("id")?;
    let parent: Option<String> = row.try_get("parent_id")?;
    let node_type: String = row.try_get("node_type")?;
    let labels: String = row.try_get("labels")?;
    let leaf: i64 = row.try_get("leaf")?;
    let connect_url: Option<String> = row.try_get("connect_url")?;

    let target = match connect_url {
        Some(connect_url) => {
            let target_labels: String = row.try_get("target_labels")?;
            let platform: String = row.try_get("platform_annotations")?;
            let cryostat: String = row.try_get("cryostat_annotations")?;
            Some(Target {
                connect_url,
                alias: row.try_get("alias")?,
                jvm_id: row.try_get("jvm_id")?,
                labels: parse_map(&target_labels)?,
                annotations: Annotations {
                    platform: parse_map(&platform)?,
                    cryostat: parse_map(&cryostat)?,
                },
            })
        }
        None => None,
    };

    Ok(NodeRecord {
        id: parse_id(&id)?,
        parent: parent.as_deref().map(parse_id).transpose()?,
        name: row.try_get("name")?,
        node_type: node_type
            .parse()
            .map_err(|e: crate::model::UnknownNodeType| StorageError::Serialization(e.to_string()))?,
        labels: parse_map(&labels)?,
        leaf: leaf != 0,
        target,
    })
}

fn decode_plugin(row: &SqliteRow) -> Result<PluginRecord> {
    let id: String = row.try_get("id")?;
    let realm: String = row.try_get("realm_id")?;
    let credential: Option<String> = row.try_get("credential")?;
    let builtin: i64 = row.try_get("builtin")?;
    Ok(PluginRecord {
        id: parse_id(&id)?,
        realm: parse_id(&realm)?,
        realm_name: row.try_get("realm_name")?,
        callback: row.try_get("callback")?,
        credential: credential
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        builtin: builtin != 0,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use super::*;
    use crate::model::Credential;

    async fn test_store() -> Arc<SqliteTopologyStore> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .expect("failed to create in-memory pool");

        let store = Arc::new(SqliteTopologyStore::new(pool));
        store.init_schema().await.expect("failed to init schema");
        store
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_node_and_target_round_trip() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();

        let root = NodeRecord::environment(None, "Universe", NodeType::Universe, Labels::new());
        tx.insert_node(&root).await.unwrap();
        let ns = NodeRecord::environment(
            Some(root.id),
            "ns1",
            NodeType::Namespace,
            labels(&[("team", "a")]),
        );
        tx.insert_node(&ns).await.unwrap();

        let target = Target::new("service:jmx:rmi:///jndi/rmi://h:9091/jmxrmi", "app")
            .with_labels(labels(&[("app", "orders")]))
            .with_annotation("REALM", "KubernetesApi");
        let leaf = NodeRecord::for_target(ns.id, target.clone(), NodeType::Jvm);
        tx.insert_node(&leaf).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let found = tx.node_by_url(&target.connect_url).await.unwrap().unwrap();
        assert_eq!(found.id, leaf.id);
        assert_eq!(found.target.as_ref(), Some(&target));
        assert_eq!(tx.root().await.unwrap().unwrap().id, root.id);
        assert_eq!(tx.children(ns.id).await.unwrap().len(), 1);
        assert_eq!(tx.targets_under(root.id).await.unwrap().len(), 1);
        assert_eq!(
            tx.node(ns.id).await.unwrap().unwrap().labels,
            labels(&[("team", "a")])
        );
    }

    #[tokio::test]
    async fn test_duplicate_alias_conflicts() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let root = NodeRecord::environment(None, "Universe", NodeType::Universe, Labels::new());
        tx.insert_node(&root).await.unwrap();
        tx.insert_node(&NodeRecord::for_target(
            root.id,
            Target::new("u1", "same"),
            NodeType::Jvm,
        ))
        .await
        .unwrap();

        let result = tx
            .insert_node(&NodeRecord::for_target(
                root.id,
                Target::new("u2", "same"),
                NodeType::Jvm,
            ))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_targets_and_plugins() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let root = NodeRecord::environment(None, "Universe", NodeType::Universe, Labels::new());
        tx.insert_node(&root).await.unwrap();
        let realm = NodeRecord::environment(Some(root.id), "p", NodeType::Realm, Labels::new());
        tx.insert_node(&realm).await.unwrap();
        tx.insert_node(&NodeRecord::for_target(
            realm.id,
            Target::new("u1", "a"),
            NodeType::Agent,
        ))
        .await
        .unwrap();
        let plugin = PluginRecord {
            callback: Some("http://cb/".to_string()),
            credential: Some(Credential {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
            builtin: false,
            ..PluginRecord::builtin(realm.id, "p")
        };
        tx.insert_plugin(&plugin).await.unwrap();
        assert_eq!(tx.plugin(plugin.id).await.unwrap(), Some(plugin.clone()));

        tx.delete_node(realm.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.nodes().await.unwrap().len(), 1);
        assert!(store.plugin_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let store = test_store().await;
        {
            let mut tx = store.begin().await.unwrap();
            let root =
                NodeRecord::environment(None, "Universe", NodeType::Universe, Labels::new());
            tx.insert_node(&root).await.unwrap();
        }
        assert!(store.nodes().await.unwrap().is_empty());
    }
}
