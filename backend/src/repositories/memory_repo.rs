use sqlx::{QueryBuilder, SqlitePool};
use uuid::Uuid;

use crate::db::models::{Memory, MemoryGraph, MemoryRelation, NewMemory, Tier};
use crate::error::AppError;

#[derive(Clone)]
pub struct MemoryRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

/// One group of rows sharing identical content, from the dedup pass.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DuplicateGroup {
    pub keep_id: String,
    pub all_ids: String,
}

impl MemoryRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
        }
    }

    pub fn with_pools(read_pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    pub async fn insert_memory(
        &self,
        memory: &NewMemory,
        content_hash: &str,
    ) -> Result<Memory, AppError> {
        let id = Uuid::new_v4().to_string();
        let keywords = serde_json::to_string(&memory.keywords)?;

        sqlx::query(
            r#"
            INSERT INTO memories (
              id, user_id, content, memory_type, category, importance, confidence,
              keywords, context, temporal_pattern, metadata, content_hash
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&id)
        .bind(&memory.user_id)
        .bind(&memory.content)
        .bind(&memory.memory_type)
        .bind(&memory.category)
        .bind(memory.importance)
        .bind(memory.confidence)
        .bind(&keywords)
        .bind(&memory.context)
        .bind(&memory.temporal_pattern)
        .bind(&memory.metadata)
        .bind(content_hash)
        .execute(&self.write_pool)
        .await?;

        for related in &memory.related_memories {
            self.insert_relation(&memory.user_id, &id, related, "related")
                .await?;
        }

        self.get_memory(&id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "memory".to_string(),
                id,
            })
    }

    pub async fn find_by_hash(
        &self,
        user_id: &str,
        content_hash: &str,
    ) -> Result<Option<Memory>, AppError> {
        let row = sqlx::query_as::<_, Memory>(
            "SELECT * FROM memories WHERE user_id = ?1 AND content_hash = ?2 LIMIT 1",
        )
        .bind(user_id)
        .bind(content_hash)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<Memory>, AppError> {
        let row = sqlx::query_as::<_, Memory>("SELECT * FROM memories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn get_memories_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new("SELECT * FROM memories WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        builder.push(")");

        let rows = builder
            .build_query_as::<Memory>()
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    pub async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Memory>, AppError> {
        let rows = if let Some(kind) = memory_type {
            sqlx::query_as::<_, Memory>(
                "SELECT * FROM memories WHERE user_id = ?1 AND memory_type = ?2 ORDER BY importance DESC, created_at DESC LIMIT ?3 OFFSET ?4",
            )
            .bind(user_id)
            .bind(kind)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.read_pool)
            .await?
        } else {
            sqlx::query_as::<_, Memory>(
                "SELECT * FROM memories WHERE user_id = ?1 ORDER BY importance DESC, created_at DESC LIMIT ?2 OFFSET ?3",
            )
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.read_pool)
            .await?
        };

        Ok(rows)
    }

    /// Recent memories, optionally filtered by type, newest first. The hybrid
    /// retrieval path uses this as its candidate pool.
    pub async fn recent_memories(
        &self,
        user_id: &str,
        memory_types: &[String],
        limit: i64,
    ) -> Result<Vec<Memory>, AppError> {
        if memory_types.is_empty() {
            let rows = sqlx::query_as::<_, Memory>(
                "SELECT * FROM memories WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.read_pool)
            .await?;
            return Ok(rows);
        }

        let mut builder =
            QueryBuilder::new("SELECT * FROM memories WHERE user_id = ");
        builder.push_bind(user_id).push(" AND memory_type IN (");
        let mut separated = builder.separated(", ");
        for kind in memory_types {
            separated.push_bind(kind);
        }
        builder.push(") ORDER BY created_at DESC LIMIT ").push_bind(limit);

        let rows = builder
            .build_query_as::<Memory>()
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    /// Keyword candidates for the instant path: any query term appearing in
    /// content or keywords. Scoring happens in the retrieval service.
    pub async fn search_text(
        &self,
        user_id: &str,
        terms: &[String],
        limit: i64,
    ) -> Result<Vec<Memory>, AppError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new("SELECT * FROM memories WHERE user_id = ");
        builder.push_bind(user_id).push(" AND (");
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            let pattern = format!("%{}%", term.replace('%', "").replace('_', ""));
            builder
                .push("content LIKE ")
                .push_bind(pattern.clone())
                .push(" OR keywords LIKE ")
                .push_bind(pattern);
        }
        builder
            .push(") ORDER BY importance DESC LIMIT ")
            .push_bind(limit);

        let rows = builder
            .build_query_as::<Memory>()
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    pub async fn update_access(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn update_content(
        &self,
        id: &str,
        content: &str,
        importance: f64,
        compressed: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE memories SET content = ?2, importance = ?3, compressed = ?4, updated_at = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .bind(content)
        .bind(importance)
        .bind(compressed as i64)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn set_tier(&self, id: &str, tier: Tier) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE memories SET tier = ?2, updated_at = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .bind(tier.as_str())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn mark_summary_only(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE memories SET summary_only = 1, updated_at = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn delete_memory(&self, id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ?1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        sqlx::query(
            "DELETE FROM memory_relations WHERE source_memory_id = ?1 OR target_memory_id = ?1",
        )
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_many(&self, ids: &[String]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::new("DELETE FROM memories WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        builder.push(")");

        let result = builder.build().execute(&self.write_pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM memories WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(&self.read_pool)
                .await?;
        Ok(count)
    }

    /// Which of the given ids still have a SQL row. The orphan-vector sweep
    /// diffs the index id map against this.
    pub async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new("SELECT id FROM memories WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        builder.push(")");

        let rows = builder
            .build_query_scalar::<String>()
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    pub async fn duplicate_groups(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<DuplicateGroup>, AppError> {
        let rows = if let Some(user) = user_id {
            sqlx::query_as::<_, DuplicateGroup>(
                r#"
                SELECT MIN(id) AS keep_id, GROUP_CONCAT(id) AS all_ids
                FROM memories
                WHERE user_id = ?1
                GROUP BY content
                HAVING COUNT(*) > 1
                "#,
            )
            .bind(user)
            .fetch_all(&self.read_pool)
            .await?
        } else {
            sqlx::query_as::<_, DuplicateGroup>(
                r#"
                SELECT MIN(id) AS keep_id, GROUP_CONCAT(id) AS all_ids
                FROM memories
                GROUP BY content
                HAVING COUNT(*) > 1
                "#,
            )
            .fetch_all(&self.read_pool)
            .await?
        };
        Ok(rows)
    }

    /// Ids eligible for importance cleanup: low importance, never accessed,
    /// older than the cutoff.
    pub async fn stale_low_importance_ids(
        &self,
        user_id: Option<&str>,
        importance_below: f64,
        cutoff: &str,
    ) -> Result<Vec<String>, AppError> {
        let rows = if let Some(user) = user_id {
            sqlx::query_scalar::<_, String>(
                "SELECT id FROM memories WHERE user_id = ?1 AND importance < ?2 AND access_count = 0 AND created_at < ?3",
            )
            .bind(user)
            .bind(importance_below)
            .bind(cutoff)
            .fetch_all(&self.read_pool)
            .await?
        } else {
            sqlx::query_scalar::<_, String>(
                "SELECT id FROM memories WHERE importance < ?1 AND access_count = 0 AND created_at < ?2",
            )
            .bind(importance_below)
            .bind(cutoff)
            .fetch_all(&self.read_pool)
            .await?
        };
        Ok(rows)
    }

    pub async fn oversized_rows(
        &self,
        user_id: Option<&str>,
        min_length: i64,
        marker: &str,
    ) -> Result<Vec<(String, String)>, AppError> {
        let pattern = format!("{marker}%");
        let rows: Vec<(String, String)> = if let Some(user) = user_id {
            sqlx::query_as(
                "SELECT id, content FROM memories WHERE user_id = ?1 AND LENGTH(content) > ?2 AND content NOT LIKE ?3",
            )
            .bind(user)
            .bind(min_length)
            .bind(&pattern)
            .fetch_all(&self.read_pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, content FROM memories WHERE LENGTH(content) > ?1 AND content NOT LIKE ?2",
            )
            .bind(min_length)
            .bind(&pattern)
            .fetch_all(&self.read_pool)
            .await?
        };
        Ok(rows)
    }

    /// All rows for the similarity-merge pass, highest importance first.
    pub async fn rows_for_merge(&self, user_id: Option<&str>) -> Result<Vec<Memory>, AppError> {
        let rows = if let Some(user) = user_id {
            sqlx::query_as::<_, Memory>(
                "SELECT * FROM memories WHERE user_id = ?1 ORDER BY importance DESC",
            )
            .bind(user)
            .fetch_all(&self.read_pool)
            .await?
        } else {
            sqlx::query_as::<_, Memory>("SELECT * FROM memories ORDER BY importance DESC")
                .fetch_all(&self.read_pool)
                .await?
        };
        Ok(rows)
    }

    /// Oldest, least important ids beyond the per-user cap.
    pub async fn archival_candidates(
        &self,
        user_id: &str,
        excess: i64,
    ) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT id FROM memories WHERE user_id = ?1 ORDER BY importance ASC, created_at ASC LIMIT ?2",
        )
        .bind(user_id)
        .bind(excess)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    /// All rows in one tier for a user, oldest first (quota promotion order).
    pub async fn tier_rows_oldest_first(
        &self,
        user_id: &str,
        tier: Tier,
    ) -> Result<Vec<Memory>, AppError> {
        let rows = sqlx::query_as::<_, Memory>(
            "SELECT * FROM memories WHERE user_id = ?1 AND tier = ?2 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(tier.as_str())
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn all_rows(&self) -> Result<Vec<Memory>, AppError> {
        let rows = sqlx::query_as::<_, Memory>("SELECT * FROM memories")
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    /// Flag rows past the warm window as compressed. Metadata-only; the
    /// optimizer's content excerpting is a separate pass.
    pub async fn mark_compressed_older_than(&self, cutoff: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE memories SET compressed = 1 WHERE compressed = 0 AND created_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn cold_low_importance_ids(
        &self,
        importance_below: f64,
    ) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT id FROM memories WHERE tier = 'cold' AND importance < ?1",
        )
        .bind(importance_below)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn distinct_user_ids(&self) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_scalar::<_, String>("SELECT DISTINCT user_id FROM memories")
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    pub async fn insert_relation(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: &str,
        relation_type: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO memory_relations (id, user_id, source_memory_id, target_memory_id, relation_type)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    /// Related-memory neighborhood as a DAG view. The depth bound makes the
    /// traversal terminate even when the edge set contains a cycle.
    pub async fn get_memory_graph(
        &self,
        user_id: &str,
        memory_id: &str,
        depth: i64,
    ) -> Result<MemoryGraph, AppError> {
        let nodes = sqlx::query_as::<_, Memory>(
            r#"
            WITH RECURSIVE graph(memory_id, level) AS (
                SELECT ?2 AS memory_id, 0 AS level
                UNION ALL
                SELECT r.target_memory_id, g.level + 1
                FROM memory_relations r
                JOIN graph g ON r.source_memory_id = g.memory_id
                WHERE g.level < ?3 AND r.user_id = ?1
            )
            SELECT DISTINCT m.*
            FROM memories m
            JOIN graph g ON g.memory_id = m.id
            WHERE m.user_id = ?1
            "#,
        )
        .bind(user_id)
        .bind(memory_id)
        .bind(depth)
        .fetch_all(&self.read_pool)
        .await?;

        let edges = sqlx::query_as::<_, MemoryRelation>(
            "SELECT * FROM memory_relations WHERE user_id = ?1 AND (source_memory_id = ?2 OR target_memory_id = ?2)",
        )
        .bind(user_id)
        .bind(memory_id)
        .fetch_all(&self.read_pool)
        .await?;

        Ok(MemoryGraph {
            root_memory_id: memory_id.to_string(),
            nodes,
            edges,
        })
    }
}
