use std::collections::BTreeSet;

use chrono::NaiveDate;
use common::types::{format_date, parse_date, InsightStatus};
use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::{check_page, now_timestamp, search, Page};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Insight {
    pub id: i64,
    pub title: String,
    pub thesis: Option<String>,
    pub status: InsightStatus,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewInsight {
    pub title: String,
    pub thesis: Option<String>,
    pub status: Option<InsightStatus>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub tags: Vec<String>,
}

/// Partial update. `None` leaves a field untouched; for the optional fields
/// `Some(None)` clears the stored value.
#[derive(Debug, Clone, Default)]
pub struct InsightPatch {
    pub title: Option<String>,
    pub thesis: Option<Option<String>>,
    pub status: Option<InsightStatus>,
    pub valid_from: Option<Option<NaiveDate>>,
    pub valid_to: Option<Option<NaiveDate>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct InsightQuery {
    pub query: Option<String>,
    pub status: Option<InsightStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for InsightQuery {
    fn default() -> Self {
        Self {
            query: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, title, thesis, status, valid_from, valid_to, tags_json, created_at, updated_at";

struct InsightRow {
    id: i64,
    title: String,
    thesis: Option<String>,
    status: String,
    valid_from: Option<String>,
    valid_to: Option<String>,
    tags_json: String,
    created_at: String,
    updated_at: String,
}

impl InsightRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            thesis: row.get(2)?,
            status: row.get(3)?,
            valid_from: row.get(4)?,
            valid_to: row.get(5)?,
            tags_json: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_insight(self) -> EngineResult<Insight> {
        let status = InsightStatus::from_str_loose(&self.status).ok_or_else(|| {
            EngineError::Malformed(format!("insight {} has status {:?}", self.id, self.status))
        })?;
        let stored_date = |raw: Option<String>| -> EngineResult<Option<NaiveDate>> {
            raw.map(|s| {
                parse_date("stored date", &s).map_err(|e| EngineError::Malformed(e.to_string()))
            })
            .transpose()
        };
        Ok(Insight {
            id: self.id,
            title: self.title,
            thesis: self.thesis,
            status,
            valid_from: stored_date(self.valid_from)?,
            valid_to: stored_date(self.valid_to)?,
            tags: serde_json::from_str(&self.tags_json)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn clean_title(raw: &str) -> EngineResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(EngineError::validation("title must not be empty"));
    }
    Ok(title.to_string())
}

fn clean_thesis(raw: Option<String>) -> Option<String> {
    raw.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

/// Trimmed, de-duplicated, sorted; blanks dropped.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn check_window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> EngineResult<()> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(EngineError::validation(format!(
                "valid_from {} is after valid_to {}",
                format_date(from),
                format_date(to)
            )));
        }
    }
    Ok(())
}

pub fn create_insight(conn: &mut Connection, new: NewInsight) -> EngineResult<Insight> {
    let title = clean_title(&new.title)?;
    let status = new.status.unwrap_or(InsightStatus::Draft);
    if status == InsightStatus::Deleted {
        return Err(EngineError::validation(
            "an insight cannot be created in the deleted state",
        ));
    }
    check_window(new.valid_from, new.valid_to)?;
    let tags_json = serde_json::to_string(&normalize_tags(&new.tags))?;
    let now = now_timestamp();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO insights (title, thesis, status, valid_from, valid_to, tags_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        rusqlite::params![
            title,
            clean_thesis(new.thesis),
            status.as_str(),
            new.valid_from.map(format_date),
            new.valid_to.map(format_date),
            tags_json,
            now,
        ],
    )?;
    let insight = get_insight(&tx, tx.last_insert_rowid())?;
    search::reindex_insight(&tx, &insight)?;
    tx.commit()?;

    tracing::info!(insight_id = insight.id, status = %insight.status, "insight created");
    Ok(insight)
}

pub fn get_insight(conn: &Connection, id: i64) -> EngineResult<Insight> {
    find_insight(conn, id)?.ok_or_else(|| EngineError::not_found("insight", id))
}

pub fn find_insight(conn: &Connection, id: i64) -> EngineResult<Option<Insight>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM insights WHERE id = ?1"),
        [id],
        InsightRow::from_row,
    )
    .optional()?
    .map(InsightRow::into_insight)
    .transpose()
}

/// Load an insight that child records may still be attached to or changed under.
pub fn get_mutable_insight(conn: &Connection, id: i64) -> EngineResult<Insight> {
    let insight = get_insight(conn, id)?;
    if insight.status == InsightStatus::Deleted {
        return Err(EngineError::validation(format!(
            "insight {id} is deleted and cannot be modified"
        )));
    }
    Ok(insight)
}

pub fn update_insight(conn: &mut Connection, id: i64, patch: InsightPatch) -> EngineResult<Insight> {
    let tx = conn.transaction()?;
    let current = get_mutable_insight(&tx, id)?;

    if patch.status == Some(InsightStatus::Deleted) {
        return Err(EngineError::validation(
            "status cannot be set to deleted by update; remove the insight instead",
        ));
    }

    let title = match patch.title {
        Some(raw) => clean_title(&raw)?,
        None => current.title,
    };
    let thesis = match patch.thesis {
        Some(raw) => clean_thesis(raw),
        None => current.thesis,
    };
    let status = patch.status.unwrap_or(current.status);
    let valid_from = patch.valid_from.unwrap_or(current.valid_from);
    let valid_to = patch.valid_to.unwrap_or(current.valid_to);
    check_window(valid_from, valid_to)?;
    let tags = patch
        .tags
        .map_or(current.tags, |tags| normalize_tags(&tags));

    tx.execute(
        "UPDATE insights
         SET title = ?2, thesis = ?3, status = ?4, valid_from = ?5, valid_to = ?6,
             tags_json = ?7, updated_at = ?8
         WHERE id = ?1",
        rusqlite::params![
            id,
            title,
            thesis,
            status.as_str(),
            valid_from.map(format_date),
            valid_to.map(format_date),
            serde_json::to_string(&tags)?,
            now_timestamp(),
        ],
    )?;
    let updated = get_insight(&tx, id)?;
    search::reindex_insight(&tx, &updated)?;
    tx.commit()?;

    if current.status != updated.status {
        tracing::info!(
            insight_id = id,
            from = %current.status,
            to = %updated.status,
            "insight status changed"
        );
    }
    Ok(updated)
}

/// Soft delete. Child records stay for audit; the insight leaves resolution,
/// evaluation and search. Removing an already-deleted insight is a no-op.
pub fn remove_insight(conn: &mut Connection, id: i64) -> EngineResult<Insight> {
    let tx = conn.transaction()?;
    let current = get_insight(&tx, id)?;
    if current.status == InsightStatus::Deleted {
        return Ok(current);
    }
    tx.execute(
        "UPDATE insights SET status = 'deleted', updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id, now_timestamp()],
    )?;
    search::unindex_insight(&tx, id)?;
    let removed = get_insight(&tx, id)?;
    tx.commit()?;

    tracing::info!(insight_id = id, "insight deleted");
    Ok(removed)
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Newest first. Deleted insights only appear when asked for by status.
pub fn list_insights(conn: &Connection, q: &InsightQuery) -> EngineResult<Page<Insight>> {
    let limit = check_page(q.limit)?;
    let pattern = q
        .query
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(like_pattern);
    let status = q.status.map(InsightStatus::as_str);

    let filter = "WHERE (?1 IS NULL OR title LIKE ?1 ESCAPE '\\' OR thesis LIKE ?1 ESCAPE '\\')
                   AND ((?2 IS NULL AND status != 'deleted') OR status = ?2)";

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM insights {filter}"),
        rusqlite::params![pattern, status],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM insights {filter}
         ORDER BY updated_at DESC, id DESC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt
        .query_map(
            rusqlite::params![pattern, status, limit as i64, q.offset as i64],
            InsightRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let items = rows
        .into_iter()
        .map(InsightRow::into_insight)
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Page {
        items,
        total: total.max(0) as u64,
        limit,
        offset: q.offset,
    })
}
