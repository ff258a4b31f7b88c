//! Step queries - cross-run listing and per-step aggregates.

use rusqlite::Result as SqliteResult;

use super::super::Database;
use pipelens_types::{StepListResponse, StepPerformanceRow, StepRecord};

/// Filters for the step listing. All set fields must match.
#[derive(Debug, Default)]
pub struct StepFilter {
    pub step_name: Option<String>,
    pub step_type: Option<String>,
    pub pipeline_name: Option<String>,
    pub min_reduction_rate: Option<f64>,
    pub max_reduction_rate: Option<f64>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub limit: i64,
    pub offset: i64,
}

// Qualified so the same list works with and without the runs join.
pub(crate) const STEP_COLUMNS: &str = "step_traces.run_id, step_traces.step_name,
     step_traces.step_type, step_traces.duration_ms, step_traces.timestamp,
     step_traces.input_count, step_traces.output_count, step_traces.reduction_rate,
     step_traces.inputs, step_traces.outputs, step_traces.input_candidates,
     step_traces.output_candidates, step_traces.decisions, step_traces.step_metadata,
     step_traces.sample_rate";

impl Database {
    pub fn query_steps(&self, filter: &StepFilter) -> SqliteResult<StepListResponse> {
        let conn = self.conn();

        let mut where_sql = if filter.pipeline_name.is_some() {
            String::from(
                " FROM step_traces
                  JOIN pipeline_runs ON pipeline_runs.run_id = step_traces.run_id
                  WHERE 1=1",
            )
        } else {
            String::from(" FROM step_traces WHERE 1=1")
        };
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref name) = filter.step_name {
            where_sql.push_str(&format!(" AND step_name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(ref step_type) = filter.step_type {
            where_sql.push_str(&format!(" AND step_type = ?{}", params.len() + 1));
            params.push(Box::new(step_type.clone()));
        }
        if let Some(ref pipeline) = filter.pipeline_name {
            where_sql.push_str(&format!(
                " AND pipeline_runs.pipeline_name = ?{}",
                params.len() + 1
            ));
            params.push(Box::new(pipeline.clone()));
        }
        if let Some(min) = filter.min_reduction_rate {
            where_sql.push_str(&format!(" AND reduction_rate >= ?{}", params.len() + 1));
            params.push(Box::new(min));
        }
        if let Some(max) = filter.max_reduction_rate {
            where_sql.push_str(&format!(" AND reduction_rate <= ?{}", params.len() + 1));
            params.push(Box::new(max));
        }
        if let Some(min) = filter.min_duration_ms {
            where_sql.push_str(&format!(" AND duration_ms >= ?{}", params.len() + 1));
            params.push(Box::new(min));
        }
        if let Some(max) = filter.max_duration_ms {
            where_sql.push_str(&format!(" AND duration_ms <= ?{}", params.len() + 1));
            params.push(Box::new(max));
        }

        let total: i64 = {
            let sql = format!("SELECT COUNT(*){}", where_sql);
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?
        };

        let mut sql = format!("SELECT {}{}", STEP_COLUMNS, where_sql);
        sql.push_str(" ORDER BY step_traces.timestamp DESC");
        sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
        params.push(Box::new(filter.limit));
        sql.push_str(&format!(" OFFSET ?{}", params.len() + 1));
        params.push(Box::new(filter.offset));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let items = stmt
            .query_map(param_refs.as_slice(), row_to_step)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(StepListResponse { total, items })
    }

    /// Aggregate stored steps per `(step_type, step_name)`. Groups with no
    /// data for an aggregate report 0.
    pub fn step_performance(
        &self,
        pipeline_name: Option<&str>,
        step_type: Option<&str>,
    ) -> SqliteResult<Vec<StepPerformanceRow>> {
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT step_type, step_name, COUNT(*),
                    AVG(reduction_rate), AVG(duration_ms),
                    MAX(reduction_rate), MIN(reduction_rate)
             FROM step_traces",
        );
        if pipeline_name.is_some() {
            sql.push_str(" JOIN pipeline_runs ON pipeline_runs.run_id = step_traces.run_id");
        }
        sql.push_str(" WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(pipeline) = pipeline_name {
            sql.push_str(&format!(
                " AND pipeline_runs.pipeline_name = ?{}",
                params.len() + 1
            ));
            params.push(Box::new(pipeline.to_string()));
        }
        if let Some(st) = step_type {
            sql.push_str(&format!(" AND step_type = ?{}", params.len() + 1));
            params.push(Box::new(st.to_string()));
        }
        sql.push_str(" GROUP BY step_type, step_name ORDER BY step_type, step_name");

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let avg_reduction: Option<f64> = row.get(3)?;
                let avg_duration: Option<f64> = row.get(4)?;
                let max_reduction: Option<f64> = row.get(5)?;
                let min_reduction: Option<f64> = row.get(6)?;
                Ok(StepPerformanceRow {
                    step_type: row.get(0)?,
                    step_name: row.get(1)?,
                    count: row.get(2)?,
                    avg_reduction_rate: round3(avg_reduction.unwrap_or(0.0)),
                    avg_duration_ms: round2(avg_duration.unwrap_or(0.0)),
                    max_reduction_rate: round3(max_reduction.unwrap_or(0.0)),
                    min_reduction_rate: round3(min_reduction.unwrap_or(0.0)),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

pub(crate) fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<StepRecord> {
    let inputs_str: String = row.get(8)?;
    let outputs_str: String = row.get(9)?;
    let input_candidates_str: String = row.get(10)?;
    let output_candidates_str: String = row.get(11)?;
    let decisions_str: String = row.get(12)?;
    let metadata_str: String = row.get(13)?;

    Ok(StepRecord {
        run_id: row.get(0)?,
        step_name: row.get(1)?,
        step_type: row.get(2)?,
        duration_ms: row.get(3)?,
        timestamp: row.get(4)?,
        input_count: row.get(5)?,
        output_count: row.get(6)?,
        reduction_rate: row.get(7)?,
        inputs: serde_json::from_str(&inputs_str).unwrap_or_default(),
        outputs: serde_json::from_str(&outputs_str).unwrap_or_default(),
        input_candidates: serde_json::from_str(&input_candidates_str).unwrap_or_default(),
        output_candidates: serde_json::from_str(&output_candidates_str).unwrap_or_default(),
        decisions: serde_json::from_str(&decisions_str).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        sample_rate: row.get(14)?,
    })
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
