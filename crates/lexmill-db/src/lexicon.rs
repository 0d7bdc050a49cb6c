//! PostgreSQL lexicon repository: scope queries and denormalized snapshots.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use lexmill_core::{
    defaults, EntitySnapshot, EntryBrief, Error, FilterExpr, FrameBrief, FrameRole,
    LexiconSource, RelatedEntry, Result, TargetKind, TargetRef,
};

use crate::filter::{bind_params, bind_scalar_params, FilterQueryBuilder};

/// PostgreSQL implementation of [`LexiconSource`].
#[derive(Clone)]
pub struct PgLexiconRepository {
    pool: Pool<Postgres>,
}

impl PgLexiconRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn table(kind: TargetKind) -> &'static str {
        match kind {
            TargetKind::Entry => "lexical_entry",
            TargetKind::Frame => "frame",
        }
    }

    fn entry_brief(row: &PgRow) -> EntryBrief {
        EntryBrief {
            id: row.get("id"),
            code: row.get("code"),
            lemma: row.get("lemma"),
            pos: row.get("pos"),
            gloss: row.get("gloss"),
            frame_id: row.get("frame_id"),
            flagged: row.get("flagged"),
            flagged_reason: row.get("flagged_reason"),
        }
    }

    fn frame_brief(row: &PgRow) -> FrameBrief {
        FrameBrief {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            definition: row.get("definition"),
            parent_id: row.get("parent_id"),
        }
    }

    async fn roles_by_frame(&self, frame_ids: &[i64]) -> Result<HashMap<i64, Vec<FrameRole>>> {
        let mut out: HashMap<i64, Vec<FrameRole>> = HashMap::new();
        if frame_ids.is_empty() {
            return Ok(out);
        }
        let rows = sqlx::query(
            "SELECT frame_id, name, description, core FROM frame_role
             WHERE frame_id = ANY($1) ORDER BY frame_id, core DESC, id",
        )
        .bind(frame_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        for row in rows {
            out.entry(row.get("frame_id")).or_default().push(FrameRole {
                name: row.get("name"),
                description: row.get("description"),
                core: row.get("core"),
            });
        }
        Ok(out)
    }

    /// Up to `per_frame` live entries of each frame, ordered by id.
    async fn entries_by_frame(
        &self,
        frame_ids: &[i64],
        per_frame: i64,
    ) -> Result<HashMap<i64, Vec<EntryBrief>>> {
        let mut out: HashMap<i64, Vec<EntryBrief>> = HashMap::new();
        if frame_ids.is_empty() {
            return Ok(out);
        }
        let rows = sqlx::query(
            "SELECT id, code, lemma, pos, gloss, frame_id, flagged, flagged_reason FROM (
                 SELECT e.id, e.code, e.lemma, e.pos, e.gloss, e.frame_id,
                        e.flagged, e.flagged_reason,
                        ROW_NUMBER() OVER (PARTITION BY e.frame_id ORDER BY e.id) AS rn
                 FROM lexical_entry e
                 WHERE e.frame_id = ANY($1) AND e.deleted_at IS NULL
             ) ranked
             WHERE rn <= $2
             ORDER BY frame_id, id",
        )
        .bind(frame_ids)
        .bind(per_frame)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        for row in rows {
            let brief = Self::entry_brief(&row);
            if let Some(frame_id) = brief.frame_id {
                out.entry(frame_id).or_default().push(brief);
            }
        }
        Ok(out)
    }

    async fn related_by_entry(&self, entry_ids: &[i64]) -> Result<HashMap<i64, Vec<RelatedEntry>>> {
        let mut out: HashMap<i64, Vec<RelatedEntry>> = HashMap::new();
        let rows = sqlx::query(
            "SELECT r.source_entry_id, t.id, t.lemma, t.gloss, r.relation_type
             FROM entry_relation r
             JOIN lexical_entry t ON t.id = r.target_entry_id AND t.deleted_at IS NULL
             WHERE r.source_entry_id = ANY($1)
             ORDER BY r.source_entry_id, r.id",
        )
        .bind(entry_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        for row in rows {
            let list = out.entry(row.get("source_entry_id")).or_default();
            if (list.len() as i64) < defaults::SNAPSHOT_RELATED_LIMIT {
                list.push(RelatedEntry {
                    id: row.get("id"),
                    lemma: row.get("lemma"),
                    relation: row.get("relation_type"),
                    gloss: row.get("gloss"),
                });
            }
        }
        Ok(out)
    }

    async fn entry_snapshots(&self, ids: &[i64]) -> Result<Vec<EntitySnapshot>> {
        let rows = sqlx::query(
            "SELECT e.id, e.code, e.lemma, e.pos, e.gloss, e.register, e.usage_note, e.frequency,
                    e.frame_id, e.flagged, e.flagged_reason,
                    f.code AS frame_code, f.name AS frame_name,
                    (SELECT c.id FROM changeset c
                      WHERE c.entity_type = 'entry' AND c.entity_id = e.id AND c.status = 'pending'
                      ORDER BY c.id DESC LIMIT 1) AS pending_changeset_id
             FROM lexical_entry e
             LEFT JOIN frame f ON f.id = e.frame_id AND f.deleted_at IS NULL
             WHERE e.id = ANY($1) AND e.deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut frame_ids: Vec<i64> = rows
            .iter()
            .filter_map(|r| r.get::<Option<i64>, _>("frame_id"))
            .collect();
        frame_ids.sort_unstable();
        frame_ids.dedup();

        let roles = self.roles_by_frame(&frame_ids).await?;
        // One extra so the entry itself can be dropped from its sibling list.
        let siblings = self
            .entries_by_frame(&frame_ids, defaults::SNAPSHOT_SIBLING_LIMIT + 1)
            .await?;
        let related = self.related_by_entry(ids).await?;

        let mut by_id: HashMap<i64, EntitySnapshot> = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let lemma: String = row.get("lemma");
            let mut snap = EntitySnapshot::new(TargetRef::Entry(id), lemma.clone());
            snap.code = row.get("code");
            snap.pos = row.get("pos");
            snap.gloss = row.get("gloss");
            snap.frame_id = row.get("frame_id");
            snap.frame_code = row.get("frame_code");
            snap.frame_name = row.get("frame_name");
            snap.flagged = row.get("flagged");
            snap.flagged_reason = row.get("flagged_reason");
            snap.pending_changeset_id = row.get("pending_changeset_id");

            let mut fields = Map::new();
            fields.insert("lemma".into(), JsonValue::from(lemma));
            for col in ["pos", "gloss", "register", "usage_note"] {
                let v: Option<String> = row.get(col);
                fields.insert(col.into(), v.map(JsonValue::from).unwrap_or(JsonValue::Null));
            }
            let freq: Option<i32> = row.get("frequency");
            fields.insert(
                "frequency".into(),
                freq.map(JsonValue::from).unwrap_or(JsonValue::Null),
            );
            snap.fields = fields;

            if let Some(frame_id) = snap.frame_id {
                snap.roles = roles.get(&frame_id).cloned().unwrap_or_default();
                snap.siblings = siblings
                    .get(&frame_id)
                    .map(|list| {
                        list.iter()
                            .filter(|s| s.id != id)
                            .take(defaults::SNAPSHOT_SIBLING_LIMIT as usize)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
            }
            snap.related = related.get(&id).cloned().unwrap_or_default();
            by_id.insert(id, snap);
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn frame_snapshots(&self, ids: &[i64]) -> Result<Vec<EntitySnapshot>> {
        let rows = sqlx::query(
            "SELECT f.id, f.code, f.name, f.definition, f.parent_id, f.flagged, f.flagged_reason,
                    p.code AS parent_code, p.name AS parent_name,
                    (SELECT c.id FROM changeset c
                      WHERE c.entity_type = 'frame' AND c.entity_id = f.id AND c.status = 'pending'
                      ORDER BY c.id DESC LIMIT 1) AS pending_changeset_id
             FROM frame f
             LEFT JOIN frame p ON p.id = f.parent_id AND p.deleted_at IS NULL
             WHERE f.id = ANY($1) AND f.deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let roles = self.roles_by_frame(ids).await?;
        let members = self
            .entries_by_frame(ids, defaults::SNAPSHOT_MEMBER_LIMIT)
            .await?;

        let child_rows = sqlx::query(
            "SELECT id, code, name, definition, parent_id FROM frame
             WHERE parent_id = ANY($1) AND deleted_at IS NULL ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        let mut children: HashMap<i64, Vec<FrameBrief>> = HashMap::new();
        for row in &child_rows {
            let brief = Self::frame_brief(row);
            if let Some(parent) = brief.parent_id {
                children.entry(parent).or_default().push(brief);
            }
        }

        let mut by_id: HashMap<i64, EntitySnapshot> = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let mut snap = EntitySnapshot::new(TargetRef::Frame(id), name.clone());
            snap.code = row.get("code");
            snap.gloss = row.get("definition");
            snap.frame_id = row.get("parent_id");
            snap.frame_code = row.get("parent_code");
            snap.frame_name = row.get("parent_name");
            snap.flagged = row.get("flagged");
            snap.flagged_reason = row.get("flagged_reason");
            snap.pending_changeset_id = row.get("pending_changeset_id");

            let mut fields = Map::new();
            fields.insert("name".into(), JsonValue::from(name));
            fields.insert(
                "definition".into(),
                snap.gloss.clone().map(JsonValue::from).unwrap_or(JsonValue::Null),
            );
            snap.fields = fields;

            snap.roles = roles.get(&id).cloned().unwrap_or_default();
            snap.members = members.get(&id).cloned().unwrap_or_default();
            snap.child_frames = children.remove(&id).unwrap_or_default();
            by_id.insert(id, snap);
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

/// Split user-supplied identifiers into numeric ids and codes.
fn split_identifiers(ids: &[String]) -> (Vec<i64>, Vec<String>) {
    let mut numeric = Vec::new();
    let mut codes = Vec::new();
    for raw in ids {
        let s = raw.trim();
        if s.is_empty() {
            continue;
        }
        match s.parse::<i64>() {
            Ok(n) => numeric.push(n),
            Err(_) => codes.push(s.to_string()),
        }
    }
    (numeric, codes)
}

#[async_trait]
impl LexiconSource for PgLexiconRepository {
    async fn resolve_ids(&self, kind: TargetKind, ids: &[String]) -> Result<Vec<i64>> {
        let (numeric, codes) = split_identifiers(ids);
        let sql = format!(
            "SELECT id, code FROM {} WHERE deleted_at IS NULL AND (id = ANY($1) OR code = ANY($2))",
            Self::table(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(&numeric)
            .bind(&codes)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut by_id = std::collections::HashSet::new();
        let mut by_code = HashMap::new();
        for row in &rows {
            let id: i64 = row.get("id");
            by_id.insert(id);
            if let Some(code) = row.get::<Option<String>, _>("code") {
                by_code.insert(code, id);
            }
        }

        Ok(ids
            .iter()
            .filter_map(|raw| {
                let s = raw.trim();
                s.parse::<i64>()
                    .ok()
                    .filter(|n| by_id.contains(n))
                    .or_else(|| by_code.get(s).copied())
            })
            .collect())
    }

    async fn count_frame_entries(&self, frame_ids: &[i64], pos: Option<&str>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM lexical_entry
             WHERE deleted_at IS NULL AND frame_id = ANY($1) AND ($2::text IS NULL OR pos = $2)",
        )
        .bind(frame_ids)
        .bind(pos)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn frame_entry_ids(
        &self,
        frame_ids: &[i64],
        pos: Option<&str>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM lexical_entry
             WHERE deleted_at IS NULL AND frame_id = ANY($1) AND ($2::text IS NULL OR pos = $2)
             ORDER BY id
             LIMIT $3 OFFSET $4",
        )
        .bind(frame_ids)
        .bind(pos)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn count_filtered(&self, kind: TargetKind, filter: &FilterExpr) -> Result<i64> {
        let (predicate, params) = FilterQueryBuilder::new(kind, "t", 0).build(filter)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} t WHERE t.deleted_at IS NULL AND {}",
            Self::table(kind),
            predicate
        );
        bind_scalar_params(sqlx::query_scalar(&sql), &params)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn filtered_ids(
        &self,
        kind: TargetKind,
        filter: &FilterExpr,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>> {
        let (predicate, params) = FilterQueryBuilder::new(kind, "t", 0).build(filter)?;
        let sql = format!(
            "SELECT t.id FROM {} t WHERE t.deleted_at IS NULL AND {} ORDER BY t.id LIMIT ${} OFFSET ${}",
            Self::table(kind),
            predicate,
            params.len() + 1,
            params.len() + 2
        );
        let rows = bind_params(sqlx::query(&sql), &params)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn snapshots(&self, kind: TargetKind, ids: &[i64]) -> Result<Vec<EntitySnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        match kind {
            TargetKind::Entry => self.entry_snapshots(ids).await,
            TargetKind::Frame => self.frame_snapshots(ids).await,
        }
    }

    async fn find_entry(&self, code_or_id: &str) -> Result<Option<EntryBrief>> {
        let s = code_or_id.trim();
        let row = sqlx::query(
            "SELECT id, code, lemma, pos, gloss, frame_id, flagged, flagged_reason
             FROM lexical_entry
             WHERE deleted_at IS NULL AND (code = $1 OR id = $2)
             ORDER BY (code = $1) DESC NULLS LAST
             LIMIT 1",
        )
        .bind(s)
        .bind(s.parse::<i64>().ok())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(Self::entry_brief))
    }

    async fn find_frame(&self, code_or_id: &str) -> Result<Option<FrameBrief>> {
        let s = code_or_id.trim();
        let row = sqlx::query(
            "SELECT id, code, name, definition, parent_id FROM frame
             WHERE deleted_at IS NULL AND (code = $1 OR id = $2)
             ORDER BY (code = $1) DESC NULLS LAST
             LIMIT 1",
        )
        .bind(s)
        .bind(s.parse::<i64>().ok())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(Self::frame_brief))
    }
}
