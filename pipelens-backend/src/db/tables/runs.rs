//! Run persistence - transactional ingestion plus filtered listing.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Result as SqliteResult};
use serde_json::{Map, Value};

use super::super::Database;
use super::steps::{STEP_COLUMNS, row_to_step};
use pipelens_types::{PipelineRun, RunDetail, RunListResponse, RunSummary, StepTrace};

/// Outcome of persisting a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Duplicate,
}

/// Filters for the run listing. All set fields must match.
#[derive(Debug, Default)]
pub struct RunFilter {
    pub pipeline_name: Option<String>,
    pub pipeline_version: Option<String>,
    pub success: Option<bool>,
    pub tag: Option<String>,
    pub context: Option<Map<String, Value>>,
    pub limit: i64,
    pub offset: i64,
}

impl Database {
    /// Persist one submitted run and its steps in a single transaction.
    ///
    /// Counts and the reduction rate are derived here from the submitted
    /// candidate lists; step order is preserved through the `seq` column.
    /// Resubmitting a known run_id changes nothing and reports `Duplicate`.
    pub fn ingest_run(&self, run: &PipelineRun) -> SqliteResult<IngestOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM pipeline_runs WHERE run_id = ?1",
                [&run.run_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(IngestOutcome::Duplicate);
        }

        tx.execute(
            "INSERT INTO pipeline_runs
                (run_id, pipeline_name, pipeline_version, success, error, started_at,
                 completed_at, total_duration_ms, context, tags, final_output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                run.run_id,
                run.pipeline_name,
                run.pipeline_version,
                run.success as i32,
                run.error,
                rfc3339_micros(run.started_at),
                run.completed_at.map(rfc3339_micros),
                run.total_duration_ms,
                serde_json::to_string(&run.context).unwrap_or_else(|_| "{}".to_string()),
                serde_json::to_string(&run.tags).unwrap_or_else(|_| "[]".to_string()),
                run.final_output.as_ref().map(|v| v.to_string()),
                rfc3339_micros(Utc::now()),
            ],
        )?;

        for (seq, step) in run.steps.iter().enumerate() {
            insert_step(&tx, &run.run_id, seq as i64, step)?;
        }

        tx.commit()?;
        Ok(IngestOutcome::Created)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> SqliteResult<RunListResponse> {
        let conn = self.conn();

        let mut where_sql = String::from(" FROM pipeline_runs WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref name) = filter.pipeline_name {
            where_sql.push_str(&format!(" AND pipeline_name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(ref version) = filter.pipeline_version {
            where_sql.push_str(&format!(" AND pipeline_version = ?{}", params.len() + 1));
            params.push(Box::new(version.clone()));
        }
        if let Some(success) = filter.success {
            where_sql.push_str(&format!(" AND success = ?{}", params.len() + 1));
            params.push(Box::new(success as i32));
        }
        if let Some(ref tag) = filter.tag {
            where_sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(pipeline_runs.tags)
                              WHERE json_each.value = ?{})",
                params.len() + 1
            ));
            params.push(Box::new(tag.clone()));
        }
        if let Some(ref context) = filter.context {
            for (key, value) in context {
                push_context_predicate(&mut where_sql, &mut params, key, value);
            }
        }

        let total: i64 = {
            let sql = format!("SELECT COUNT(*){}", where_sql);
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?
        };

        let mut sql = format!(
            "SELECT run_id, pipeline_name, pipeline_version, success, total_duration_ms,
                    started_at, completed_at, context, tags,
                    (SELECT COUNT(*) FROM step_traces
                     WHERE step_traces.run_id = pipeline_runs.run_id) AS step_count
             {}",
            where_sql
        );
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
        params.push(Box::new(filter.limit));
        sql.push_str(&format!(" OFFSET ?{}", params.len() + 1));
        params.push(Box::new(filter.offset));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let items = stmt
            .query_map(param_refs.as_slice(), row_to_run_summary)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(RunListResponse { total, items })
    }

    pub fn get_run(&self, run_id: &str) -> SqliteResult<Option<RunDetail>> {
        let conn = self.conn();

        let detail = conn
            .query_row(
                "SELECT run_id, pipeline_name, pipeline_version, success, error,
                        started_at, completed_at, total_duration_ms, context, tags,
                        final_output, created_at
                 FROM pipeline_runs WHERE run_id = ?1",
                [run_id],
                row_to_run_detail,
            )
            .optional()?;
        let Some(mut detail) = detail else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM step_traces WHERE step_traces.run_id = ?1 ORDER BY seq",
            STEP_COLUMNS
        ))?;
        detail.steps = stmt
            .query_map([run_id], row_to_step)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(detail))
    }
}

fn insert_step(
    tx: &rusqlite::Transaction,
    run_id: &str,
    seq: i64,
    step: &StepTrace,
) -> SqliteResult<()> {
    let input_count = step.input_candidates.len() as i64;
    let output_count = step.output_candidates.len() as i64;
    let reduction_rate = if input_count > 0 {
        1.0 - output_count as f64 / input_count as f64
    } else {
        0.0
    };

    tx.execute(
        "INSERT INTO step_traces
            (run_id, seq, step_name, step_type, duration_ms, timestamp,
             input_count, output_count, reduction_rate, inputs, outputs,
             input_candidates, output_candidates, decisions, step_metadata, sample_rate)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            run_id,
            seq,
            step.step_name,
            step.step_type,
            step.duration_ms,
            rfc3339_micros(step.timestamp),
            input_count,
            output_count,
            reduction_rate,
            serde_json::to_string(&step.inputs).unwrap_or_else(|_| "{}".to_string()),
            serde_json::to_string(&step.outputs).unwrap_or_else(|_| "{}".to_string()),
            serde_json::to_string(&step.input_candidates).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&step.output_candidates).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&step.decisions).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&step.metadata).unwrap_or_else(|_| "{}".to_string()),
            step.sample_rate,
        ],
    )?;
    Ok(())
}

/// Stored timestamp format: UTC, fixed micros, so text order is time order.
pub(crate) fn rfc3339_micros(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn push_context_predicate(
    sql: &mut String,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    key: &str,
    value: &Value,
) {
    let path = format!("$.\"{}\"", key);
    match value {
        Value::Null => {
            sql.push_str(&format!(
                " AND json_type(context, ?{}) = 'null'",
                params.len() + 1
            ));
            params.push(Box::new(path));
        }
        Value::Bool(b) => {
            sql.push_str(&format!(
                " AND json_extract(context, ?{}) = ?{}",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(Box::new(path));
            params.push(Box::new(*b as i64));
        }
        Value::Number(n) => {
            sql.push_str(&format!(
                " AND json_extract(context, ?{}) = ?{}",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(Box::new(path));
            if let Some(i) = n.as_i64() {
                params.push(Box::new(i));
            } else {
                params.push(Box::new(n.as_f64().unwrap_or(0.0)));
            }
        }
        Value::String(s) => {
            sql.push_str(&format!(
                " AND json_extract(context, ?{}) = ?{}",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(Box::new(path));
            params.push(Box::new(s.clone()));
        }
        // Arrays and objects compare via SQLite's canonical rendering of
        // both sides.
        other => {
            sql.push_str(&format!(
                " AND json_extract(context, ?{}) = json_extract(?{}, '$')",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(Box::new(path));
            params.push(Box::new(other.to_string()));
        }
    }
}

fn row_to_run_summary(row: &rusqlite::Row) -> rusqlite::Result<RunSummary> {
    let success_int: i32 = row.get(3)?;
    let context_str: String = row.get(7)?;
    let tags_str: String = row.get(8)?;

    Ok(RunSummary {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        pipeline_version: row.get(2)?,
        success: success_int != 0,
        total_duration_ms: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        step_count: row.get(9)?,
        context: serde_json::from_str(&context_str).unwrap_or_default(),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
    })
}

fn row_to_run_detail(row: &rusqlite::Row) -> rusqlite::Result<RunDetail> {
    let success_int: i32 = row.get(3)?;
    let context_str: String = row.get(8)?;
    let tags_str: String = row.get(9)?;
    let final_output_str: Option<String> = row.get(10)?;

    Ok(RunDetail {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        pipeline_version: row.get(2)?,
        success: success_int != 0,
        error: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        total_duration_ms: row.get(7)?,
        context: serde_json::from_str(&context_str).unwrap_or_default(),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        final_output: final_output_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(11)?,
        steps: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelens_types::Candidate;
    use serde_json::json;

    fn step_with_counts(name: &str, inputs: usize, outputs: usize) -> StepTrace {
        let mut step = StepTrace::new(name, "filter");
        step.input_candidates = (0..inputs)
            .map(|i| Candidate::new(format!("in_{i}")))
            .collect();
        step.output_candidates = (0..outputs)
            .map(|i| Candidate::new(format!("out_{i}")))
            .collect();
        step.duration_ms = Some(5.0);
        step
    }

    fn run_with(
        pipeline: &str,
        success: bool,
        tags: &[&str],
        context: Map<String, Value>,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(pipeline);
        run.success = success;
        run.tags = tags.iter().map(|t| t.to_string()).collect();
        run.context = context;
        run.completed_at = Some(Utc::now());
        run
    }

    fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn default_filter() -> RunFilter {
        RunFilter {
            limit: 100,
            ..RunFilter::default()
        }
    }

    #[test]
    fn ingest_derives_counts_and_preserves_step_order() {
        let db = Database::new(":memory:").expect("database");
        let mut run = PipelineRun::new("search");
        run.steps.push(step_with_counts("narrow", 10, 2));
        run.steps.push(step_with_counts("expand", 0, 5));
        run.steps.push(step_with_counts("widen", 4, 6));

        let outcome = db.ingest_run(&run).expect("ingest");
        assert_eq!(outcome, IngestOutcome::Created);

        let detail = db.get_run(&run.run_id).expect("query").expect("present");
        assert!(!detail.created_at.is_empty());
        let names: Vec<&str> = detail.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["narrow", "expand", "widen"]);

        assert_eq!(detail.steps[0].input_count, 10);
        assert_eq!(detail.steps[0].output_count, 2);
        assert!((detail.steps[0].reduction_rate - 0.8).abs() < 1e-9);
        // No inputs means no reduction, even when outputs appear.
        assert_eq!(detail.steps[1].reduction_rate, 0.0);
        // Expansion yields a negative rate, stored as-is.
        assert!((detail.steps[2].reduction_rate - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn duplicate_run_id_reports_conflict_and_keeps_original() {
        let db = Database::new(":memory:").expect("database");
        let mut original = PipelineRun::new("first");
        original.steps.push(step_with_counts("only", 2, 1));
        db.ingest_run(&original).expect("ingest");

        let mut replay = original.clone();
        replay.pipeline_name = "second".to_string();
        replay.steps.push(step_with_counts("extra", 3, 3));
        let outcome = db.ingest_run(&replay).expect("ingest");
        assert_eq!(outcome, IngestOutcome::Duplicate);

        let detail = db
            .get_run(&original.run_id)
            .expect("query")
            .expect("present");
        assert_eq!(detail.pipeline_name, "first");
        assert_eq!(detail.steps.len(), 1);
    }

    #[test]
    fn list_filters_are_conjunctive() {
        let db = Database::new(":memory:").expect("database");
        db.ingest_run(&run_with("alpha", true, &["prod"], Map::new()))
            .expect("ingest");
        db.ingest_run(&run_with("alpha", false, &["prod"], Map::new()))
            .expect("ingest");
        db.ingest_run(&run_with("beta", true, &["dev"], Map::new()))
            .expect("ingest");

        let page = db
            .list_runs(&RunFilter {
                pipeline_name: Some("alpha".to_string()),
                success: Some(true),
                tag: Some("prod".to_string()),
                ..default_filter()
            })
            .expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].pipeline_name, "alpha");
        assert!(page.items[0].success);

        let page = db
            .list_runs(&RunFilter {
                tag: Some("prod".to_string()),
                ..default_filter()
            })
            .expect("list");
        assert_eq!(page.total, 2);
    }

    #[test]
    fn version_filter_narrows_runs() {
        let db = Database::new(":memory:").expect("database");
        let mut v1 = PipelineRun::new("alpha");
        v1.pipeline_version = "1.0.0".to_string();
        let mut v2 = PipelineRun::new("alpha");
        v2.pipeline_version = "2.0.0".to_string();
        db.ingest_run(&v1).expect("ingest");
        db.ingest_run(&v2).expect("ingest");

        let page = db
            .list_runs(&RunFilter {
                pipeline_version: Some("2.0.0".to_string()),
                ..default_filter()
            })
            .expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].run_id, v2.run_id);
    }

    #[test]
    fn context_filter_matches_subset_values() {
        let db = Database::new(":memory:").expect("database");
        let stored = context(&[
            ("plan", json!("premium")),
            ("attempt", json!(2)),
            ("beta", json!(true)),
            ("params", json!({"depth": 3, "mode": "fast"})),
        ]);
        let run = run_with("ctx", true, &[], stored);
        db.ingest_run(&run).expect("ingest");

        let matching = [
            context(&[("plan", json!("premium"))]),
            context(&[("plan", json!("premium")), ("attempt", json!(2))]),
            context(&[("beta", json!(true))]),
            context(&[("params", json!({"depth": 3, "mode": "fast"}))]),
        ];
        for ctx in matching {
            let page = db
                .list_runs(&RunFilter {
                    context: Some(ctx.clone()),
                    ..default_filter()
                })
                .expect("list");
            assert_eq!(page.total, 1, "expected match for {:?}", ctx);
        }

        let rejecting = [
            context(&[("plan", json!("basic"))]),
            context(&[("plan", json!("premium")), ("missing", json!(1))]),
            context(&[("attempt", json!(3))]),
            context(&[("params", json!({"depth": 3}))]),
        ];
        for ctx in rejecting {
            let page = db
                .list_runs(&RunFilter {
                    context: Some(ctx.clone()),
                    ..default_filter()
                })
                .expect("list");
            assert_eq!(page.total, 0, "expected no match for {:?}", ctx);
        }
    }

    #[test]
    fn listing_orders_newest_first_and_paginates() {
        let db = Database::new(":memory:").expect("database");
        let mut ids = Vec::new();
        for i in 0..4 {
            let run = PipelineRun::new(format!("page_{i}"));
            ids.push(run.run_id.clone());
            db.ingest_run(&run).expect("ingest");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page = db
            .list_runs(&RunFilter {
                limit: 2,
                ..default_filter()
            })
            .expect("list");
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].run_id, ids[3]);
        assert_eq!(page.items[1].run_id, ids[2]);

        let page = db
            .list_runs(&RunFilter {
                limit: 2,
                offset: 3,
                ..default_filter()
            })
            .expect("list");
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].run_id, ids[0]);
    }
}
