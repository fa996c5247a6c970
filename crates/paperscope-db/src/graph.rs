//! PostgreSQL knowledge graph repository.
//!
//! Nodes and edges live in `graph_node` / `graph_edge`, keyed by natural keys.
//! Every merge is an `INSERT .. ON CONFLICT DO UPDATE` that only touches the
//! row when the merged properties differ, so re-applying a mutation is a
//! no-op and concurrent writers only contend on the rows they share.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, instrument};

use paperscope_core::{
    CommitResult, EdgeUpsert, Error, GraphEdge, GraphMutation, GraphNode, GraphStats, GraphStore,
    NodeKey, NodeLabel, PaperNeighborhood, PaperNetwork, RelType, Result,
};

/// Map Postgres failures onto the pipeline taxonomy.
///
/// Serialization failures, deadlocks, and unique violations mean another
/// writer won a race: the caller may retry with a fresh transaction.
pub(crate) fn map_graph_error(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("40001") | Some("40P01") | Some("23505") => {
                return Error::GraphConflict(db.message().to_string());
            }
            Some("23503") => {
                return Error::PermanentInput(format!(
                    "edge references a missing node: {}",
                    db.message()
                ));
            }
            _ => {}
        }
    }
    Error::Database(e)
}

fn edge_signature(edge: &EdgeUpsert) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        edge.from.label.as_str(),
        edge.from.key,
        edge.rel.as_str(),
        edge.to.label.as_str(),
        edge.to.key,
        edge.relation
    )
}

fn parse_key(label: &str, key: String) -> Result<NodeKey> {
    let label = NodeLabel::parse(label)
        .ok_or_else(|| Error::Internal(format!("unknown node label in graph: {label}")))?;
    Ok(NodeKey { label, key })
}

fn parse_node_row(row: &PgRow) -> Result<GraphNode> {
    Ok(GraphNode {
        key: parse_key(row.get("label"), row.get("node_key"))?,
        properties: row.get("properties"),
    })
}

fn parse_edge_row(row: &PgRow) -> Result<GraphEdge> {
    let rel: String = row.get("rel_type");
    Ok(GraphEdge {
        from: parse_key(row.get("from_label"), row.get("from_key"))?,
        rel: RelType::parse(&rel)
            .ok_or_else(|| Error::Internal(format!("unknown relationship type: {rel}")))?,
        to: parse_key(row.get("to_label"), row.get("to_key"))?,
        relation: row.get("relation"),
        asserted_by: row.get("asserted_by"),
    })
}

/// PostgreSQL implementation of GraphStore.
#[derive(Clone)]
pub struct PgGraphRepository {
    pool: Pool<Postgres>,
}

impl PgGraphRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GraphStore for PgGraphRepository {
    #[instrument(skip(self, mutation), fields(subsystem = "db", component = "graph", op = "apply", paper_key = %mutation.paper_key))]
    async fn apply(&self, mutation: &GraphMutation) -> Result<CommitResult> {
        let start = Instant::now();
        let mut result = CommitResult::default();
        let mut tx = self.pool.begin().await.map_err(map_graph_error)?;

        // Fixed lock order across writers keeps deadlocks rare.
        let mut nodes: Vec<_> = mutation.nodes.iter().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));

        for node in nodes {
            let inserted: Option<bool> = sqlx::query_scalar(
                r#"
                INSERT INTO graph_node (label, node_key, properties)
                VALUES ($1, $2, $3)
                ON CONFLICT (label, node_key) DO UPDATE
                    SET properties = graph_node.properties || EXCLUDED.properties,
                        updated_at = now()
                    WHERE graph_node.properties IS DISTINCT FROM graph_node.properties || EXCLUDED.properties
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(node.key.label.as_str())
            .bind(&node.key.key)
            .bind(JsonValue::Object(node.properties.clone()))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_graph_error)?;

            match inserted {
                Some(true) => result.nodes_created += 1,
                Some(false) => result.nodes_updated += 1,
                None => {}
            }
        }

        let mut asserted = Vec::new();
        for edge in &mutation.edges {
            if edge.require_existing {
                let exists: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (SELECT 1 FROM graph_node WHERE label = $1 AND node_key = $2)
                       AND EXISTS (SELECT 1 FROM graph_node WHERE label = $3 AND node_key = $4)
                    "#,
                )
                .bind(edge.from.label.as_str())
                .bind(&edge.from.key)
                .bind(edge.to.label.as_str())
                .bind(&edge.to.key)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_graph_error)?;

                if !exists {
                    debug!(from = %edge.from, to = %edge.to, relation = %edge.relation, "Dropping unresolved relation");
                    result.relations_dropped += 1;
                    continue;
                }
            }

            let inserted: Option<bool> = sqlx::query_scalar(
                r#"
                INSERT INTO graph_edge (from_label, from_key, rel_type, to_label, to_key, relation, properties, asserted_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, ARRAY[$8::text])
                ON CONFLICT (from_label, from_key, rel_type, to_label, to_key, relation) DO UPDATE
                    SET properties = graph_edge.properties || EXCLUDED.properties,
                        asserted_by = CASE
                            WHEN $8 = ANY(graph_edge.asserted_by) THEN graph_edge.asserted_by
                            ELSE array_append(graph_edge.asserted_by, $8)
                        END,
                        updated_at = now()
                    WHERE graph_edge.properties IS DISTINCT FROM graph_edge.properties || EXCLUDED.properties
                       OR NOT ($8 = ANY(graph_edge.asserted_by))
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(edge.from.label.as_str())
            .bind(&edge.from.key)
            .bind(edge.rel.as_str())
            .bind(edge.to.label.as_str())
            .bind(&edge.to.key)
            .bind(&edge.relation)
            .bind(JsonValue::Object(edge.properties.clone()))
            .bind(&mutation.paper_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_graph_error)?;

            match inserted {
                Some(true) => result.edges_created += 1,
                Some(false) => result.edges_updated += 1,
                None => {}
            }

            asserted.push(edge_signature(edge));
        }

        if mutation.prune_paper_edges {
            let retracted = sqlx::query(
                r#"
                UPDATE graph_edge
                SET asserted_by = array_remove(asserted_by, $1),
                    updated_at = now()
                WHERE $1 = ANY(asserted_by)
                  AND rel_type IN ('MENTIONS', 'RELATES_TO')
                  AND NOT ((from_label || '|' || from_key || '|' || rel_type || '|' || to_label
                            || '|' || to_key || '|' || relation) = ANY($2))
                "#,
            )
            .bind(&mutation.paper_key)
            .bind(&asserted)
            .execute(&mut *tx)
            .await
            .map_err(map_graph_error)?;

            let pruned = sqlx::query(
                r#"
                DELETE FROM graph_edge
                WHERE rel_type IN ('MENTIONS', 'RELATES_TO')
                  AND cardinality(asserted_by) = 0
                "#,
            )
            .execute(&mut *tx)
            .await
            .map_err(map_graph_error)?;
            result.edges_pruned = pruned.rows_affected() as usize;
            result.edges_updated += retracted.rows_affected().saturating_sub(pruned.rows_affected()) as usize;
        }

        tx.commit().await.map_err(map_graph_error)?;

        debug!(
            nodes_created = result.nodes_created,
            edges_created = result.edges_created,
            relations_dropped = result.relations_dropped,
            duration_ms = start.elapsed().as_millis() as u64,
            "Graph mutation committed"
        );
        Ok(result)
    }

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>> {
        let row = sqlx::query(
            "SELECT label, node_key, properties FROM graph_node WHERE label = $1 AND node_key = $2",
        )
        .bind(key.label.as_str())
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_node_row).transpose()
    }

    async fn recent_papers(&self, limit: i64) -> Result<Vec<GraphNode>> {
        let rows = sqlx::query(
            r#"
            SELECT label, node_key, properties
            FROM graph_node
            WHERE label = 'Paper'
            ORDER BY updated_at DESC, node_key
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_node_row).collect()
    }

    async fn paper_neighborhood(&self, paper_key: &str) -> Result<Option<PaperNeighborhood>> {
        let Some(paper) = self.get_node(&NodeKey::paper(paper_key)).await? else {
            return Ok(None);
        };

        let edge_rows = sqlx::query(
            r#"
            SELECT from_label, from_key, rel_type, to_label, to_key, relation, asserted_by
            FROM graph_edge
            WHERE (from_label = 'Paper' AND from_key = $1)
               OR (to_label = 'Paper' AND to_key = $1)
            ORDER BY rel_type, to_label, to_key, relation
            "#,
        )
        .bind(paper_key)
        .fetch_all(&self.pool)
        .await?;
        let edges = edge_rows
            .iter()
            .map(parse_edge_row)
            .collect::<Result<Vec<_>>>()?;

        let node_rows = sqlx::query(
            r#"
            SELECT DISTINCT n.label, n.node_key, n.properties
            FROM graph_node n
            JOIN graph_edge e
              ON (e.from_label = 'Paper' AND e.from_key = $1
                  AND e.to_label = n.label AND e.to_key = n.node_key)
              OR (e.to_label = 'Paper' AND e.to_key = $1
                  AND e.from_label = n.label AND e.from_key = n.node_key)
            ORDER BY n.label, n.node_key
            "#,
        )
        .bind(paper_key)
        .fetch_all(&self.pool)
        .await?;
        let nodes = node_rows
            .iter()
            .map(parse_node_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(PaperNeighborhood {
            paper,
            nodes,
            edges,
        }))
    }

    async fn paper_network(&self, limit: i64) -> Result<PaperNetwork> {
        let papers = self.recent_papers(limit).await?;
        let keys: Vec<String> = papers.iter().map(|p| p.key.key.clone()).collect();

        let edge_rows = sqlx::query(
            r#"
            SELECT from_label, from_key, rel_type, to_label, to_key, relation, asserted_by
            FROM graph_edge
            WHERE rel_type = 'MENTIONS' AND from_label = 'Paper' AND from_key = ANY($1)
            ORDER BY from_key, to_key
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await?;
        let mentions = edge_rows
            .iter()
            .map(parse_edge_row)
            .collect::<Result<Vec<_>>>()?;

        let concept_rows = sqlx::query(
            r#"
            SELECT DISTINCT n.label, n.node_key, n.properties
            FROM graph_node n
            JOIN graph_edge e
              ON e.to_label = n.label AND e.to_key = n.node_key
            WHERE e.rel_type = 'MENTIONS' AND e.from_label = 'Paper' AND e.from_key = ANY($1)
              AND n.label = 'Concept'
            ORDER BY n.label, n.node_key
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await?;
        let concepts = concept_rows
            .iter()
            .map(parse_node_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(PaperNetwork::assemble(papers, mentions, concepts))
    }

    async fn stats(&self) -> Result<GraphStats> {
        let node_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT label, count(*) FROM graph_node GROUP BY label")
                .fetch_all(&self.pool)
                .await?;
        let edge_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT rel_type, count(*) FROM graph_edge GROUP BY rel_type")
                .fetch_all(&self.pool)
                .await?;
        Ok(GraphStats {
            nodes: node_rows.into_iter().collect::<BTreeMap<_, _>>(),
            edges: edge_rows.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_edge_signature_format() {
        let edge = EdgeUpsert {
            from: NodeKey::paper("hf:1"),
            rel: RelType::RelatesTo,
            to: NodeKey::concept("lora"),
            relation: "extends".into(),
            properties: Map::new(),
            require_existing: false,
        };
        assert_eq!(
            edge_signature(&edge),
            "Paper|hf:1|RELATES_TO|Concept|lora|extends"
        );
    }

    #[test]
    fn test_parse_key_rejects_unknown_label() {
        assert!(parse_key("Venue", "x".into()).is_err());
        assert_eq!(
            parse_key("Author", "a smith".into()).unwrap(),
            NodeKey::author("a smith")
        );
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL with migrated database
    async fn test_unique_violation_maps_to_conflict() {
        let _ = dotenvy::dotenv();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = sqlx::PgPool::connect(&url).await.unwrap();
        let key = format!("conflict:{}", uuid::Uuid::new_v4().simple());
        let insert = "INSERT INTO graph_node (label, node_key) VALUES ('Paper', $1)";

        sqlx::query(insert).bind(&key).execute(&pool).await.unwrap();
        let err = sqlx::query(insert).bind(&key).execute(&pool).await.unwrap_err();
        assert!(matches!(map_graph_error(err), Error::GraphConflict(_)));

        sqlx::query("DELETE FROM graph_node WHERE node_key = $1")
            .bind(&key)
            .execute(&pool)
            .await
            .unwrap();
    }

    #[test]
    fn test_non_database_errors_pass_through() {
        let err = map_graph_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Database(_)));
    }
}
