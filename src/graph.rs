//! Entity/relationship storage and bounded graph expansion.
//!
//! The write side is append-merge: enrichment results carry entity and
//! relationship lists which are upserted — names are unique, descriptions
//! refresh, per-document mention counts accumulate. Nothing is ever
//! deleted here.
//!
//! The read side is a breadth-first expansion from a seed entity name with
//! explicit caps on entity count and wall-clock time. The response carries
//! a `meta` record (`capped`, `timedOut`, `warnings`) so callers can tell a
//! small graph from a truncated one.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Hard cap on entities returned by one expansion.
pub const MAX_ENTITIES: usize = 100;
/// Wall-clock budget for one expansion.
pub const TIME_BUDGET: Duration = Duration::from_secs(2);
/// Default traversal depth.
pub const DEFAULT_DEPTH: u32 = 2;

/// One entity as submitted by an enrichment worker.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityInput {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Mention count within the submitting document.
    #[serde(default)]
    pub mentions: Option<i32>,
}

/// One relationship as submitted by an enrichment worker.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipInput {
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub rel_type: Option<String>,
}

/// Merge a result's extraction into the graph tables. Runs inside the
/// caller's transaction so a rejected result leaves no partial graph.
pub async fn merge_extraction(
    conn: &mut PgConnection,
    document_id: Uuid,
    entities: &[EntityInput],
    relationships: &[RelationshipInput],
) -> Result<()> {
    for entity in entities {
        let name = entity.name.trim();
        if name.is_empty() {
            continue;
        }

        let entity_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO entities (id, name, entity_type, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                entity_type = EXCLUDED.entity_type,
                description = COALESCE(EXCLUDED.description, entities.description)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(entity.entity_type.as_deref().unwrap_or("unknown"))
        .bind(&entity.description)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO entity_mentions (entity_id, document_id, mention_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_id, document_id)
            DO UPDATE SET mention_count = entity_mentions.mention_count + EXCLUDED.mention_count
            "#,
        )
        .bind(entity_id)
        .bind(document_id)
        .bind(entity.mentions.unwrap_or(1).max(1))
        .execute(&mut *conn)
        .await?;
    }

    for rel in relationships {
        let source = rel.source.trim();
        let target = rel.target.trim();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO relationships (id, source, target, rel_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source, target, rel_type) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source)
        .bind(target)
        .bind(rel.rel_type.as_deref().unwrap_or("related_to"))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// One node in the expansion result.
#[derive(Debug, Serialize)]
pub struct GraphNode {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
    /// Hops from the seed; the seed itself is depth 0.
    pub depth: u32,
    /// Documents mentioning this entity.
    pub documents: Vec<MentioningDocument>,
}

#[derive(Debug, Serialize)]
pub struct MentioningDocument {
    pub id: Uuid,
    #[serde(rename = "baseId")]
    pub base_id: String,
    pub collection: String,
    pub source: String,
    #[serde(rename = "mentionCount")]
    pub mention_count: i32,
}

/// Directed edge in the expansion result.
#[derive(Debug, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
}

#[derive(Debug, Default, Serialize)]
pub struct GraphMeta {
    pub capped: bool,
    #[serde(rename = "timedOut")]
    pub timed_out: bool,
    pub warnings: Vec<String>,
}

/// Full expansion result for one seed entity.
#[derive(Debug, Serialize)]
pub struct GraphExpansion {
    pub entity: GraphNode,
    pub neighbours: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Name chains from the seed to each reached entity.
    pub paths: Vec<Vec<String>>,
    pub meta: GraphMeta,
}

/// Expand the graph around `name` up to `depth` hops, bounded by
/// [`MAX_ENTITIES`] and [`TIME_BUDGET`].
pub async fn expand(pool: &PgPool, name: &str, depth: u32) -> Result<GraphExpansion> {
    let started = Instant::now();
    let depth = depth.clamp(1, 5);

    let seed = fetch_entity(pool, name).await?.ok_or_else(|| {
        Error::NotFound(format!("entity '{}' not found", name))
    })?;

    let mut meta = GraphMeta::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut order: Vec<(String, u32)> = Vec::new();
    let mut edges: Vec<GraphEdge> = Vec::new();
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();

    visited.insert(seed.0.clone());
    order.push((seed.0.clone(), 0));
    queue.push_back((seed.0.clone(), 0));

    'bfs: while let Some((current, level)) = queue.pop_front() {
        if level >= depth {
            continue;
        }
        if started.elapsed() > TIME_BUDGET {
            meta.timed_out = true;
            meta.warnings.push("expansion stopped at time budget".into());
            break;
        }

        let rows = sqlx::query(
            r#"
            SELECT source, target, rel_type FROM relationships
            WHERE source = $1 OR target = $1
            ORDER BY source, target
            "#,
        )
        .bind(&current)
        .fetch_all(pool)
        .await?;

        for row in rows {
            let source: String = row.get("source");
            let target: String = row.get("target");
            let rel_type: String = row.get("rel_type");
            let other = if source == current { &target } else { &source };

            edges.push(GraphEdge {
                source: source.clone(),
                target: target.clone(),
                rel_type,
            });

            if visited.contains(other) {
                continue;
            }
            if visited.len() >= MAX_ENTITIES {
                meta.capped = true;
                meta.warnings
                    .push(format!("entity cap of {} reached", MAX_ENTITIES));
                break 'bfs;
            }
            visited.insert(other.clone());
            parents.insert(other.clone(), current.clone());
            order.push((other.clone(), level + 1));
            queue.push_back((other.clone(), level + 1));
        }
    }

    // Deduplicate edges collected from both directions.
    let mut seen_edges = HashSet::new();
    edges.retain(|e| seen_edges.insert((e.source.clone(), e.target.clone(), e.rel_type.clone())));

    let mut nodes = Vec::with_capacity(order.len());
    for (entity_name, level) in &order {
        match fetch_node(pool, entity_name, *level).await? {
            Some(node) => nodes.push(node),
            None => meta
                .warnings
                .push(format!("entity '{}' vanished during expansion", entity_name)),
        }
    }

    let paths = order
        .iter()
        .skip(1)
        .map(|(entity_name, _)| {
            let mut path = vec![entity_name.clone()];
            let mut cursor = entity_name;
            while let Some(parent) = parents.get(cursor) {
                path.push(parent.clone());
                cursor = parent;
            }
            path.reverse();
            path
        })
        .collect();

    let mut iter = nodes.into_iter();
    let entity = iter
        .next()
        .ok_or_else(|| Error::NotFound(format!("entity '{}' not found", name)))?;

    Ok(GraphExpansion {
        entity,
        neighbours: iter.collect(),
        edges,
        paths,
        meta,
    })
}

async fn fetch_entity(pool: &PgPool, name: &str) -> Result<Option<(String,)>> {
    let row = sqlx::query("SELECT name FROM entities WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| (r.get("name"),)))
}

async fn fetch_node(pool: &PgPool, name: &str, depth: u32) -> Result<Option<GraphNode>> {
    let row = sqlx::query("SELECT name, entity_type, description FROM entities WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let documents = sqlx::query(
        r#"
        SELECT d.id, d.base_id, d.collection, d.source, m.mention_count
        FROM entity_mentions m
        JOIN entities e ON e.id = m.entity_id
        JOIN documents d ON d.id = m.document_id
        WHERE e.name = $1
        ORDER BY m.mention_count DESC, d.base_id
        LIMIT 20
        "#,
    )
    .bind(name)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|r| MentioningDocument {
        id: r.get("id"),
        base_id: r.get("base_id"),
        collection: r.get("collection"),
        source: r.get("source"),
        mention_count: r.get("mention_count"),
    })
    .collect();

    Ok(Some(GraphNode {
        name: row.get("name"),
        entity_type: row.get("entity_type"),
        description: row.get("description"),
        depth,
        documents,
    }))
}
