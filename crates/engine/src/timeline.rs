//! Effect channels and their dated breakpoints.
//!
//! A channel says *how* an insight moves one metric of one valuation method
//! (stage, operator, priority); its points say *how much* on a given date.
//! Values between two points are linear in calendar days; outside the first
//! and last point the channel has no value.

use chrono::NaiveDate;
use common::types::{
    format_date, parse_date, require_finite, EffectOperator, MethodKey, MetricKey, Stage,
};
use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::insights::{get_insight, get_mutable_insight};
use crate::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectChannel {
    pub id: i64,
    pub insight_id: i64,
    pub method_key: MethodKey,
    pub metric_key: MetricKey,
    pub stage: Stage,
    pub operator: EffectOperator,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectPoint {
    pub id: i64,
    pub channel_id: i64,
    pub effect_date: NaiveDate,
    pub effect_value: f64,
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub method_key: MethodKey,
    pub metric_key: MetricKey,
    pub stage: Stage,
    pub operator: EffectOperator,
    pub priority: i64,
}

/// Outcome of sampling a channel on one date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelSample {
    Value(f64),
    OutOfRange { first: NaiveDate, last: NaiveDate },
    NoPoints,
}

impl ChannelSample {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::OutOfRange { .. } | Self::NoPoints => None,
        }
    }
}

const CHANNEL_COLUMNS: &str =
    "id, insight_id, method_key, metric_key, stage, operator, priority, created_at, updated_at";

pub(crate) struct ChannelRow {
    id: i64,
    insight_id: i64,
    method_key: String,
    metric_key: String,
    stage: String,
    operator: String,
    priority: i64,
    created_at: String,
    updated_at: String,
}

impl ChannelRow {
    /// Reads the nine channel columns starting at `offset`.
    pub(crate) fn from_row_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            insight_id: row.get(offset + 1)?,
            method_key: row.get(offset + 2)?,
            metric_key: row.get(offset + 3)?,
            stage: row.get(offset + 4)?,
            operator: row.get(offset + 5)?,
            priority: row.get(offset + 6)?,
            created_at: row.get(offset + 7)?,
            updated_at: row.get(offset + 8)?,
        })
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Self::from_row_at(row, 0)
    }

    pub(crate) fn into_channel(self) -> EngineResult<EffectChannel> {
        let id = self.id;
        let malformed = |what: &str, raw: &str| {
            EngineError::Malformed(format!("effect channel {id} has {what} {raw:?}"))
        };
        Ok(EffectChannel {
            id,
            insight_id: self.insight_id,
            method_key: MethodKey::parse(&self.method_key)
                .map_err(|_invalid| malformed("method_key", &self.method_key))?,
            metric_key: MetricKey::parse(&self.metric_key)
                .map_err(|_invalid| malformed("metric_key", &self.metric_key))?,
            stage: Stage::from_str_loose(&self.stage).ok_or_else(|| malformed("stage", &self.stage))?,
            operator: EffectOperator::from_str_loose(&self.operator)
                .ok_or_else(|| malformed("operator", &self.operator))?,
            priority: self.priority,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub fn get_effect_channel(conn: &Connection, id: i64) -> EngineResult<EffectChannel> {
    conn.query_row(
        &format!("SELECT {CHANNEL_COLUMNS} FROM effect_channels WHERE id = ?1"),
        [id],
        ChannelRow::from_row,
    )
    .optional()?
    .map(ChannelRow::into_channel)
    .transpose()?
    .ok_or_else(|| EngineError::not_found("effect channel", id))
}

/// Create or update the channel identified by (insight, method, metric, stage).
/// An existing channel keeps its id and points; operator and priority change.
pub fn upsert_effect_channel(
    conn: &mut Connection,
    insight_id: i64,
    spec: ChannelSpec,
) -> EngineResult<EffectChannel> {
    let tx = conn.transaction()?;
    get_mutable_insight(&tx, insight_id)?;

    tx.execute(
        "INSERT INTO effect_channels (insight_id, method_key, metric_key, stage, operator, priority, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(insight_id, method_key, metric_key, stage) DO UPDATE SET
            operator = excluded.operator,
            priority = excluded.priority,
            updated_at = excluded.updated_at",
        rusqlite::params![
            insight_id,
            spec.method_key.as_str(),
            spec.metric_key.as_str(),
            spec.stage.as_str(),
            spec.operator.as_str(),
            spec.priority,
            now_timestamp(),
        ],
    )?;
    let id: i64 = tx.query_row(
        "SELECT id FROM effect_channels
         WHERE insight_id = ?1 AND method_key = ?2 AND metric_key = ?3 AND stage = ?4",
        rusqlite::params![
            insight_id,
            spec.method_key.as_str(),
            spec.metric_key.as_str(),
            spec.stage.as_str(),
        ],
        |row| row.get(0),
    )?;
    let channel = get_effect_channel(&tx, id)?;
    tx.commit()?;

    tracing::info!(
        insight_id,
        channel_id = channel.id,
        method_key = %channel.method_key,
        metric_key = %channel.metric_key,
        stage = %channel.stage,
        operator = %channel.operator,
        priority = channel.priority,
        "effect channel upserted"
    );
    Ok(channel)
}

/// Hard delete; the channel's points go with it.
pub fn remove_effect_channel(conn: &mut Connection, id: i64) -> EngineResult<EffectChannel> {
    let tx = conn.transaction()?;
    let channel = get_effect_channel(&tx, id)?;
    get_mutable_insight(&tx, channel.insight_id)?;
    let points = tx.execute("DELETE FROM effect_points WHERE channel_id = ?1", [id])?;
    tx.execute("DELETE FROM effect_channels WHERE id = ?1", [id])?;
    tx.commit()?;
    tracing::info!(insight_id = channel.insight_id, channel_id = id, points, "effect channel removed");
    Ok(channel)
}

/// Sorted by stage, then priority, then id.
pub fn list_effect_channels(conn: &Connection, insight_id: i64) -> EngineResult<Vec<EffectChannel>> {
    get_insight(conn, insight_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM effect_channels WHERE insight_id = ?1"
    ))?;
    let rows = stmt
        .query_map([insight_id], ChannelRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut channels = rows
        .into_iter()
        .map(ChannelRow::into_channel)
        .collect::<EngineResult<Vec<_>>>()?;
    channels.sort_by_key(|c| (c.stage, c.priority, c.id));
    Ok(channels)
}

fn point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, String, f64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_point((id, channel_id, date, value): (i64, i64, String, f64)) -> EngineResult<EffectPoint> {
    let effect_date = parse_date("effect_date", &date)
        .map_err(|_invalid| EngineError::Malformed(format!("effect point {id} has date {date:?}")))?;
    Ok(EffectPoint {
        id,
        channel_id,
        effect_date,
        effect_value: value,
    })
}

/// Create or replace the point on (channel, date).
pub fn upsert_effect_point(
    conn: &mut Connection,
    channel_id: i64,
    effect_date: NaiveDate,
    effect_value: f64,
) -> EngineResult<EffectPoint> {
    let effect_value = require_finite("effect_value", effect_value)?;
    let tx = conn.transaction()?;
    let channel = get_effect_channel(&tx, channel_id)?;
    get_mutable_insight(&tx, channel.insight_id)?;

    let date = format_date(effect_date);
    tx.execute(
        "INSERT INTO effect_points (channel_id, effect_date, effect_value) VALUES (?1, ?2, ?3)
         ON CONFLICT(channel_id, effect_date) DO UPDATE SET effect_value = excluded.effect_value",
        rusqlite::params![channel_id, date, effect_value],
    )?;
    let point = tx
        .query_row(
            "SELECT id, channel_id, effect_date, effect_value FROM effect_points
             WHERE channel_id = ?1 AND effect_date = ?2",
            rusqlite::params![channel_id, date],
            point_from_row,
        )
        .map_err(EngineError::from)
        .and_then(into_point)?;
    tx.commit()?;

    tracing::debug!(channel_id, effect_date = %date, effect_value, "effect point upserted");
    Ok(point)
}

pub fn remove_effect_point(conn: &mut Connection, id: i64) -> EngineResult<EffectPoint> {
    let tx = conn.transaction()?;
    let point = tx
        .query_row(
            "SELECT id, channel_id, effect_date, effect_value FROM effect_points WHERE id = ?1",
            [id],
            point_from_row,
        )
        .optional()?
        .map(into_point)
        .transpose()?
        .ok_or_else(|| EngineError::not_found("effect point", id))?;
    let channel = get_effect_channel(&tx, point.channel_id)?;
    get_mutable_insight(&tx, channel.insight_id)?;
    tx.execute("DELETE FROM effect_points WHERE id = ?1", [id])?;
    tx.commit()?;
    tracing::debug!(channel_id = point.channel_id, point_id = id, "effect point removed");
    Ok(point)
}

/// Points of one channel ordered by date.
pub fn list_effect_points(conn: &Connection, channel_id: i64) -> EngineResult<Vec<EffectPoint>> {
    get_effect_channel(conn, channel_id)?;
    load_points(conn, channel_id)
}

pub(crate) fn load_points(conn: &Connection, channel_id: i64) -> EngineResult<Vec<EffectPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, channel_id, effect_date, effect_value FROM effect_points
         WHERE channel_id = ?1 ORDER BY effect_date",
    )?;
    let rows = stmt
        .query_map([channel_id], point_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_point).collect()
}

/// Sample date-sorted `points` on `as_of`.
pub fn sample(points: &[EffectPoint], as_of: NaiveDate) -> ChannelSample {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return ChannelSample::NoPoints;
    };
    if as_of < first.effect_date || as_of > last.effect_date {
        return ChannelSample::OutOfRange {
            first: first.effect_date,
            last: last.effect_date,
        };
    }
    // First point dated on or after as_of; it exists because as_of <= last.
    let idx = points.partition_point(|p| p.effect_date < as_of);
    let right = &points[idx];
    if right.effect_date == as_of || idx == 0 {
        return ChannelSample::Value(right.effect_value);
    }
    let left = &points[idx - 1];
    let span = (right.effect_date - left.effect_date).num_days() as f64;
    let offset = (as_of - left.effect_date).num_days() as f64;
    let t = offset / span;
    ChannelSample::Value(left.effect_value + (right.effect_value - left.effect_value) * t)
}

/// Interpolated value on `as_of`, `None` outside the point range.
pub fn interpolate(points: &[EffectPoint], as_of: NaiveDate) -> Option<f64> {
    sample(points, as_of).value()
}

pub fn interpolate_channel(
    conn: &Connection,
    channel_id: i64,
    as_of: NaiveDate,
) -> EngineResult<Option<f64>> {
    Ok(interpolate(&list_effect_points(conn, channel_id)?, as_of))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{create_insight, remove_insight, NewInsight};
    use crate::test_support::db;

    fn date(s: &str) -> NaiveDate {
        parse_date("test", s).unwrap()
    }

    fn pt(d: &str, v: f64) -> EffectPoint {
        EffectPoint {
            id: 0,
            channel_id: 0,
            effect_date: date(d),
            effect_value: v,
        }
    }

    fn spec(metric: &str, stage: Stage, operator: EffectOperator) -> ChannelSpec {
        ChannelSpec {
            method_key: MethodKey::wildcard(),
            metric_key: MetricKey::parse(metric).unwrap(),
            stage,
            operator,
            priority: 0,
        }
    }

    fn insight(conn: &mut Connection) -> i64 {
        create_insight(
            conn,
            NewInsight {
                title: "Margin recovery".to_string(),
                ..NewInsight::default()
            },
        )
        .unwrap()
        .id
    }

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_interpolation_between_and_at_boundaries() {
        let points = vec![pt("2026-01-01", 0.0), pt("2026-01-11", 10.0), pt("2026-01-21", 0.0)];
        assert!(approx(interpolate(&points, date("2026-01-01")), 0.0));
        assert!(approx(interpolate(&points, date("2026-01-11")), 10.0));
        assert!(approx(interpolate(&points, date("2026-01-21")), 0.0));
        assert!(approx(interpolate(&points, date("2026-01-04")), 3.0));
        assert!(approx(interpolate(&points, date("2026-01-16")), 5.0));

        // Strictly between two points the value stays between their values.
        for day in 2..11 {
            let d = date("2026-01-01") + chrono::Duration::days(day - 1);
            let v = interpolate(&points, d).unwrap();
            assert!(v > 0.0 && v < 10.0, "day {day}: {v}");
        }
    }

    #[test]
    fn test_no_value_outside_range() {
        let points = vec![pt("2026-01-10", 1.0), pt("2026-01-20", 2.0)];
        assert_eq!(interpolate(&points, date("2026-01-09")), None);
        assert_eq!(interpolate(&points, date("2026-01-21")), None);
        assert_eq!(
            sample(&points, date("2026-02-01")),
            ChannelSample::OutOfRange {
                first: date("2026-01-10"),
                last: date("2026-01-20"),
            }
        );
        assert_eq!(sample(&[], date("2026-01-10")), ChannelSample::NoPoints);
    }

    #[test]
    fn test_single_point_only_on_its_date() {
        let points = vec![pt("2026-03-01", 4.5)];
        assert!(approx(interpolate(&points, date("2026-03-01")), 4.5));
        assert_eq!(interpolate(&points, date("2026-03-02")), None);
        assert_eq!(interpolate(&points, date("2026-02-28")), None);
    }

    #[test]
    fn test_channel_upsert_keeps_identity() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let first = upsert_effect_channel(&mut db.conn, id, spec("fair_value", Stage::Output, EffectOperator::Add)).unwrap();
        let again = upsert_effect_channel(
            &mut db.conn,
            id,
            ChannelSpec {
                priority: 5,
                ..spec("fair_value", Stage::Output, EffectOperator::Mul)
            },
        )
        .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.operator, EffectOperator::Mul);
        assert_eq!(again.priority, 5);

        let other_stage = upsert_effect_channel(&mut db.conn, id, spec("fair_value", Stage::Base, EffectOperator::Set)).unwrap();
        assert_ne!(other_stage.id, first.id);

        let listed: Vec<Stage> = list_effect_channels(&db.conn, id).unwrap().iter().map(|c| c.stage).collect();
        assert_eq!(listed, vec![Stage::Base, Stage::Output]);
    }

    #[test]
    fn test_points_upsert_by_date_and_cascade_on_channel_removal() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let ch = upsert_effect_channel(&mut db.conn, id, spec("fair_value", Stage::Output, EffectOperator::Add)).unwrap();

        upsert_effect_point(&mut db.conn, ch.id, date("2026-02-01"), 2.0).unwrap();
        upsert_effect_point(&mut db.conn, ch.id, date("2026-01-01"), 1.0).unwrap();
        let replaced = upsert_effect_point(&mut db.conn, ch.id, date("2026-02-01"), 3.0).unwrap();
        assert!((replaced.effect_value - 3.0).abs() < 1e-12);

        let points = list_effect_points(&db.conn, ch.id).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].effect_date, date("2026-01-01"));
        assert!(approx(interpolate_channel(&db.conn, ch.id, date("2026-02-01")).unwrap(), 3.0));

        assert!(upsert_effect_point(&mut db.conn, ch.id, date("2026-03-01"), f64::NAN)
            .unwrap_err()
            .is_validation());

        remove_effect_channel(&mut db.conn, ch.id).unwrap();
        let orphans: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM effect_points", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        assert!(list_effect_points(&db.conn, ch.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_point_and_deleted_parent() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let ch = upsert_effect_channel(&mut db.conn, id, spec("eps", Stage::FirstOrder, EffectOperator::Mul)).unwrap();
        let p = upsert_effect_point(&mut db.conn, ch.id, date("2026-01-01"), 1.1).unwrap();
        remove_effect_point(&mut db.conn, p.id).unwrap();
        assert!(remove_effect_point(&mut db.conn, p.id).unwrap_err().is_not_found());

        remove_insight(&mut db.conn, id).unwrap();
        let err = upsert_effect_point(&mut db.conn, ch.id, date("2026-01-02"), 1.0).unwrap_err();
        assert!(err.is_validation());
        let err = upsert_effect_channel(&mut db.conn, id, spec("eps", Stage::Risk, EffectOperator::Min)).unwrap_err();
        assert!(err.is_validation());
    }
}
