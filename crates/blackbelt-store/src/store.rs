//! SQLite-backed store for the knowledge graph, measurement stream and
//! instruction lifecycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use blackbelt_core::EngineError;

use crate::models::{
    ActionDef, ActionPriority, Batch, BatchStatus, FlowEdge, Instruction, InstructionKind,
    InstructionStatus, Measurement, MeasurementSource, NewInstruction, NewMeasurement, NodeType,
    ParamDataType, ParamRole, ParameterDef, ProcessNode, RiskCategory, RiskEdge, RiskNode,
    TargetRole, DEFAULT_PRODUCT_NAME,
};

const SCHEMA_VERSION: i64 = 2;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn store_err(context: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::StoreUnavailable(format!("{}: {}", context, e))
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(db_path).map_err(|e| store_err("open store", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and throwaway environments.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("open store", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), EngineError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at_ms INTEGER NOT NULL
             )",
            [],
        )
        .map_err(|e| store_err("create migration table", e))?;

        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| store_err("read schema version", e))?;
        if current > SCHEMA_VERSION {
            return Err(EngineError::StoreUnavailable(format!(
                "schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "baseline_tables")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "instruction_dedup_index")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process graph
    // ------------------------------------------------------------------

    pub fn upsert_node(&self, node: &ProcessNode) -> Result<(), EngineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_process_nodes (code, name, node_type, parent_code)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(code) DO UPDATE SET
               name = excluded.name,
               node_type = excluded.node_type,
               parent_code = excluded.parent_code",
            params![
                node.code,
                node.name,
                node.node_type.as_str(),
                node.parent_code
            ],
        )
        .map_err(|e| store_err("upsert node", e))?;
        Ok(())
    }

    pub fn node(&self, code: &str) -> Result<Option<ProcessNode>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT code, name, node_type, parent_code FROM meta_process_nodes WHERE code = ?1",
            params![code],
            map_row_to_node,
        )
        .optional()
        .map_err(|e| store_err("get node", e))
    }

    pub fn nodes(&self) -> Result<Vec<ProcessNode>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT code, name, node_type, parent_code FROM meta_process_nodes ORDER BY code",
            )
            .map_err(|e| store_err("prepare list nodes", e))?;
        let rows = stmt
            .query_map([], map_row_to_node)
            .map_err(|e| store_err("query list nodes", e))?;
        collect_rows(rows, "scan list nodes")
    }

    pub fn nodes_by_type(&self, node_type: NodeType) -> Result<Vec<ProcessNode>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT code, name, node_type, parent_code FROM meta_process_nodes
                 WHERE node_type = ?1 ORDER BY code",
            )
            .map_err(|e| store_err("prepare nodes by type", e))?;
        let rows = stmt
            .query_map(params![node_type.as_str()], map_row_to_node)
            .map_err(|e| store_err("query nodes by type", e))?;
        collect_rows(rows, "scan nodes by type")
    }

    /// Unit nodes whose parent is the given block.
    pub fn child_units(&self, block_code: &str) -> Result<Vec<ProcessNode>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT code, name, node_type, parent_code FROM meta_process_nodes
                 WHERE parent_code = ?1 AND node_type = 'Unit' ORDER BY code",
            )
            .map_err(|e| store_err("prepare child units", e))?;
        let rows = stmt
            .query_map(params![block_code], map_row_to_node)
            .map_err(|e| store_err("query child units", e))?;
        collect_rows(rows, "scan child units")
    }

    pub fn insert_flow_edge(&self, edge: &FlowEdge) -> Result<(), EngineError> {
        if self.node(&edge.source_code)?.is_none() {
            return Err(EngineError::UnknownEntity(format!(
                "flow source node: {}",
                edge.source_code
            )));
        }
        if self.node(&edge.target_code)?.is_none() {
            return Err(EngineError::UnknownEntity(format!(
                "flow target node: {}",
                edge.target_code
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_process_flows (source_code, target_code, name, loss_rate)
             VALUES (?1, ?2, ?3, ?4)",
            params![edge.source_code, edge.target_code, edge.name, edge.loss_rate],
        )
        .map_err(|e| store_err("insert flow edge", e))?;
        Ok(())
    }

    pub fn flow_edges(&self) -> Result<Vec<FlowEdge>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT source_code, target_code, name, loss_rate
                 FROM meta_process_flows ORDER BY id",
            )
            .map_err(|e| store_err("prepare flow edges", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FlowEdge {
                    source_code: row.get(0)?,
                    target_code: row.get(1)?,
                    name: row.get(2)?,
                    loss_rate: row.get(3)?,
                })
            })
            .map_err(|e| store_err("query flow edges", e))?;
        collect_rows(rows, "scan flow edges")
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn upsert_parameter(&self, param: &ParameterDef) -> Result<(), EngineError> {
        param.validate()?;
        if self.node(&param.node_code)?.is_none() {
            return Err(EngineError::UnknownEntity(format!(
                "node for parameter: {}",
                param.node_code
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_parameters
               (node_code, code, name, unit, role, usl, lsl, target, data_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(node_code, code) DO UPDATE SET
               name = excluded.name,
               unit = excluded.unit,
               role = excluded.role,
               usl = excluded.usl,
               lsl = excluded.lsl,
               target = excluded.target,
               data_type = excluded.data_type",
            params![
                param.node_code,
                param.code,
                param.name,
                param.unit,
                param.role.as_str(),
                param.usl,
                param.lsl,
                param.target,
                param.data_type.as_str()
            ],
        )
        .map_err(|e| store_err("upsert parameter", e))?;
        Ok(())
    }

    pub fn parameter(
        &self,
        node_code: &str,
        code: &str,
    ) -> Result<Option<ParameterDef>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT node_code, code, name, unit, role, usl, lsl, target, data_type
             FROM meta_parameters WHERE node_code = ?1 AND code = ?2",
            params![node_code, code],
            map_row_to_parameter,
        )
        .optional()
        .map_err(|e| store_err("get parameter", e))
    }

    /// First parameter definition carrying this code, regardless of
    /// node. Used when a caller supplies only a parameter code.
    pub fn parameter_by_code(&self, code: &str) -> Result<Option<ParameterDef>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT node_code, code, name, unit, role, usl, lsl, target, data_type
             FROM meta_parameters WHERE code = ?1 ORDER BY node_code LIMIT 1",
            params![code],
            map_row_to_parameter,
        )
        .optional()
        .map_err(|e| store_err("get parameter by code", e))
    }

    pub fn parameters_for_node(&self, node_code: &str) -> Result<Vec<ParameterDef>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_code, code, name, unit, role, usl, lsl, target, data_type
                 FROM meta_parameters WHERE node_code = ?1 ORDER BY code",
            )
            .map_err(|e| store_err("prepare node parameters", e))?;
        let rows = stmt
            .query_map(params![node_code], map_row_to_parameter)
            .map_err(|e| store_err("query node parameters", e))?;
        collect_rows(rows, "scan node parameters")
    }

    // ------------------------------------------------------------------
    // Risks
    // ------------------------------------------------------------------

    pub fn upsert_risk(&self, risk: &RiskNode) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&risk.base_probability) {
            return Err(EngineError::BadRequest(format!(
                "risk {}: base_probability {} outside [0, 1]",
                risk.code, risk.base_probability
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_risk_nodes (code, name, category, base_probability)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(code) DO UPDATE SET
               name = excluded.name,
               category = excluded.category,
               base_probability = excluded.base_probability",
            params![
                risk.code,
                risk.name,
                risk.category.as_str(),
                risk.base_probability
            ],
        )
        .map_err(|e| store_err("upsert risk", e))?;
        Ok(())
    }

    pub fn risks(&self) -> Result<Vec<RiskNode>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT code, name, category, base_probability
                 FROM meta_risk_nodes ORDER BY code",
            )
            .map_err(|e| store_err("prepare risks", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RiskNode {
                    code: row.get(0)?,
                    name: row.get(1)?,
                    category: parse_enum(row.get::<_, String>(2)?, RiskCategory::from_str)?,
                    base_probability: row.get(3)?,
                })
            })
            .map_err(|e| store_err("query risks", e))?;
        collect_rows(rows, "scan risks")
    }

    /// Insert a causal edge, rejecting anything that would close a cycle.
    pub fn insert_risk_edge(&self, edge: &RiskEdge) -> Result<(), EngineError> {
        let risks: HashSet<String> = self.risks()?.into_iter().map(|r| r.code).collect();
        if !risks.contains(&edge.source_code) {
            return Err(EngineError::UnknownEntity(format!(
                "risk edge source: {}",
                edge.source_code
            )));
        }
        if !risks.contains(&edge.target_code) {
            return Err(EngineError::UnknownEntity(format!(
                "risk edge target: {}",
                edge.target_code
            )));
        }
        if edge.source_code == edge.target_code
            || self.risk_path_exists(&edge.target_code, &edge.source_code)?
        {
            return Err(EngineError::BadRequest(format!(
                "risk edge {} -> {} would create a cycle",
                edge.source_code, edge.target_code
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_risk_edges (source_code, target_code, weight)
             VALUES (?1, ?2, ?3)",
            params![edge.source_code, edge.target_code, edge.weight],
        )
        .map_err(|e| store_err("insert risk edge", e))?;
        Ok(())
    }

    pub fn risk_edges(&self) -> Result<Vec<RiskEdge>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT source_code, target_code, weight FROM meta_risk_edges ORDER BY id",
            )
            .map_err(|e| store_err("prepare risk edges", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RiskEdge {
                    source_code: row.get(0)?,
                    target_code: row.get(1)?,
                    weight: row.get(2)?,
                })
            })
            .map_err(|e| store_err("query risk edges", e))?;
        collect_rows(rows, "scan risk edges")
    }

    fn risk_path_exists(&self, from: &str, to: &str) -> Result<bool, EngineError> {
        let edges = self.risk_edges()?;
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            adjacency
                .entry(edge.source_code.as_str())
                .or_default()
                .push(edge.target_code.as_str());
        }
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == to {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(nexts) = adjacency.get(current) {
                queue.extend(nexts.iter().copied());
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub fn upsert_action(&self, action: &ActionDef) -> Result<(), EngineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_actions
               (code, name, risk_code, target_role, instruction_template,
                priority, category, estimated_impact, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(code) DO UPDATE SET
               name = excluded.name,
               risk_code = excluded.risk_code,
               target_role = excluded.target_role,
               instruction_template = excluded.instruction_template,
               priority = excluded.priority,
               category = excluded.category,
               estimated_impact = excluded.estimated_impact,
               active = excluded.active",
            params![
                action.code,
                action.name,
                action.risk_code,
                action.target_role.as_str(),
                action.instruction_template,
                action.priority.as_str(),
                action.category,
                action.estimated_impact,
                action.active as i64
            ],
        )
        .map_err(|e| store_err("upsert action", e))?;
        Ok(())
    }

    pub fn actions(&self, active_only: bool) -> Result<Vec<ActionDef>, EngineError> {
        let conn = self.lock()?;
        let sql = if active_only {
            "SELECT code, name, risk_code, target_role, instruction_template,
                    priority, category, estimated_impact, active
             FROM meta_actions WHERE active = 1 ORDER BY code"
        } else {
            "SELECT code, name, risk_code, target_role, instruction_template,
                    priority, category, estimated_impact, active
             FROM meta_actions ORDER BY code"
        };
        let mut stmt = conn.prepare(sql).map_err(|e| store_err("prepare actions", e))?;
        let rows = stmt
            .query_map([], map_row_to_action)
            .map_err(|e| store_err("query actions", e))?;
        collect_rows(rows, "scan actions")
    }

    // ------------------------------------------------------------------
    // Batches & measurements
    // ------------------------------------------------------------------

    /// Explicit batch creation; an already auto-created batch is updated
    /// rather than rejected.
    pub fn upsert_batch(&self, batch: &Batch) -> Result<(), EngineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO data_batches (id, product_name, operator_id, start_time_ms, end_time_ms, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               product_name = excluded.product_name,
               operator_id = excluded.operator_id,
               start_time_ms = excluded.start_time_ms,
               end_time_ms = excluded.end_time_ms,
               status = excluded.status",
            params![
                batch.id,
                batch.product_name,
                batch.operator_id,
                dt_to_ms(batch.start_time),
                batch.end_time.map(dt_to_ms),
                batch.status.as_str()
            ],
        )
        .map_err(|e| store_err("upsert batch", e))?;
        Ok(())
    }

    pub fn batch(&self, id: &str) -> Result<Option<Batch>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, product_name, operator_id, start_time_ms, end_time_ms, status
             FROM data_batches WHERE id = ?1",
            params![id],
            map_row_to_batch,
        )
        .optional()
        .map_err(|e| store_err("get batch", e))
    }

    pub fn batches(&self) -> Result<Vec<Batch>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, product_name, operator_id, start_time_ms, end_time_ms, status
                 FROM data_batches ORDER BY id",
            )
            .map_err(|e| store_err("prepare batches", e))?;
        let rows = stmt
            .query_map([], map_row_to_batch)
            .map_err(|e| store_err("query batches", e))?;
        collect_rows(rows, "scan batches")
    }

    pub fn batch_ids_for_operator(
        &self,
        operator_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<String>, EngineError> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        if let Some((start, end)) = range {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM data_batches
                     WHERE operator_id = ?1 AND start_time_ms >= ?2 AND start_time_ms < ?3
                     ORDER BY id",
                )
                .map_err(|e| store_err("prepare operator batches", e))?;
            let rows = stmt
                .query_map(params![operator_id, dt_to_ms(start), dt_to_ms(end)], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| store_err("query operator batches", e))?;
            for row in rows {
                out.push(row.map_err(|e| store_err("scan operator batches", e))?);
            }
        } else {
            let mut stmt = conn
                .prepare("SELECT id FROM data_batches WHERE operator_id = ?1 ORDER BY id")
                .map_err(|e| store_err("prepare operator batches", e))?;
            let rows = stmt
                .query_map(params![operator_id], |row| row.get::<_, String>(0))
                .map_err(|e| store_err("query operator batches", e))?;
            for row in rows {
                out.push(row.map_err(|e| store_err("scan operator batches", e))?);
            }
        }
        Ok(out)
    }

    /// Append one measurement. The referenced node and parameter must
    /// exist; an unseen batch id is created on the fly with defaults.
    pub fn insert_measurement(
        &self,
        measurement: &NewMeasurement,
    ) -> Result<Measurement, EngineError> {
        if self.node(&measurement.node_code)?.is_none() {
            return Err(EngineError::UnknownEntity(format!(
                "node: {}",
                measurement.node_code
            )));
        }
        if self
            .parameter(&measurement.node_code, &measurement.param_code)?
            .is_none()
        {
            return Err(EngineError::UnknownEntity(format!(
                "parameter: {}.{}",
                measurement.node_code, measurement.param_code
            )));
        }
        let timestamp = measurement.timestamp.unwrap_or_else(Utc::now);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| store_err("begin measurement tx", e))?;
        let created = tx
            .execute(
                "INSERT OR IGNORE INTO data_batches
                   (id, product_name, operator_id, start_time_ms, end_time_ms, status)
                 VALUES (?1, ?2, NULL, ?3, NULL, 'Running')",
                params![measurement.batch_id, DEFAULT_PRODUCT_NAME, dt_to_ms(timestamp)],
            )
            .map_err(|e| store_err("auto-create batch", e))?;
        if created > 0 {
            tracing::info!(batch_id = %measurement.batch_id, "auto-created batch");
        }
        tx.execute(
            "INSERT INTO data_measurements
               (batch_id, node_code, param_code, value, timestamp_ms, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                measurement.batch_id,
                measurement.node_code,
                measurement.param_code,
                measurement.value,
                dt_to_ms(timestamp),
                measurement.source.as_str()
            ],
        )
        .map_err(|e| store_err("insert measurement", e))?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(|e| store_err("commit measurement", e))?;
        Ok(Measurement {
            id,
            batch_id: measurement.batch_id.clone(),
            node_code: measurement.node_code.clone(),
            param_code: measurement.param_code.clone(),
            value: measurement.value,
            timestamp,
            source: measurement.source,
        })
    }

    /// Most recent `limit` rows matching the filters, returned in
    /// ascending timestamp order.
    pub fn measurements(
        &self,
        filter: &MeasurementFilter<'_>,
        limit: usize,
    ) -> Result<Vec<Measurement>, EngineError> {
        let mut sql = String::from(
            "SELECT id, batch_id, node_code, param_code, value, timestamp_ms, source
             FROM data_measurements WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(batch_id) = filter.batch_id {
            sql.push_str(" AND batch_id = ?");
            args.push(Box::new(batch_id.to_string()));
        }
        if let Some(node_code) = filter.node_code {
            sql.push_str(" AND node_code = ?");
            args.push(Box::new(node_code.to_string()));
        }
        if let Some(param_code) = filter.param_code {
            sql.push_str(" AND param_code = ?");
            args.push(Box::new(param_code.to_string()));
        }
        if let Some(node_codes) = filter.node_codes {
            if node_codes.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; node_codes.len()].join(", ");
            sql.push_str(&format!(" AND node_code IN ({})", placeholders));
            for code in node_codes {
                args.push(Box::new((*code).to_string()));
            }
        }
        if let Some(batch_ids) = filter.batch_ids {
            if batch_ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; batch_ids.len()].join(", ");
            sql.push_str(&format!(" AND batch_id IN ({})", placeholders));
            for id in batch_ids {
                args.push(Box::new(id.clone()));
            }
        }
        if let Some((start, end)) = filter.range {
            sql.push_str(" AND timestamp_ms >= ? AND timestamp_ms < ?");
            args.push(Box::new(dt_to_ms(start)));
            args.push(Box::new(dt_to_ms(end)));
        }
        sql.push_str(" ORDER BY timestamp_ms DESC, id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| store_err("prepare measurements", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                map_row_to_measurement,
            )
            .map_err(|e| store_err("query measurements", e))?;
        let mut out = collect_rows(rows, "scan measurements")?;
        out.reverse();
        Ok(out)
    }

    pub fn latest_measurement(
        &self,
        node_code: &str,
        param_code: &str,
    ) -> Result<Option<Measurement>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, batch_id, node_code, param_code, value, timestamp_ms, source
             FROM data_measurements
             WHERE node_code = ?1 AND param_code = ?2
             ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
            params![node_code, param_code],
            map_row_to_measurement,
        )
        .optional()
        .map_err(|e| store_err("latest measurement", e))
    }

    /// Distinct parameter codes with data at a node, sorted.
    pub fn measured_params_for_node(&self, node_code: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT param_code FROM data_measurements
                 WHERE node_code = ?1 ORDER BY param_code",
            )
            .map_err(|e| store_err("prepare measured params", e))?;
        let rows = stmt
            .query_map(params![node_code], |row| row.get::<_, String>(0))
            .map_err(|e| store_err("query measured params", e))?;
        collect_rows(rows, "scan measured params")
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// Insert unless the dedup tuple `(target_date, role, action_code,
    /// batch_id, node_code)` already exists. Returns the new id, or
    /// `None` when coalesced into an existing instruction.
    pub fn insert_instruction_if_absent(
        &self,
        instruction: &NewInstruction,
    ) -> Result<Option<i64>, EngineError> {
        let evidence_json = Value::Object(instruction.evidence.clone()).to_string();
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO data_instructions
                   (target_date, role, action_code, batch_id, node_code, param_code,
                    content, status, priority, evidence_json, feedback,
                    instruction_type, created_at_ms, read_at_ms, done_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'Pending', ?8, ?9, NULL, ?10, ?11, NULL, NULL)",
                params![
                    instruction.target_date,
                    instruction.role.as_str(),
                    instruction.action_code,
                    instruction.batch_id,
                    instruction.node_code,
                    instruction.param_code,
                    instruction.content,
                    instruction.priority.as_str(),
                    evidence_json,
                    instruction.instruction_type.as_str(),
                    dt_to_ms(Utc::now())
                ],
            )
            .map_err(|e| store_err("insert instruction", e))?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    pub fn instruction(&self, id: i64) -> Result<Option<Instruction>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{} WHERE id = ?1", INSTRUCTION_SELECT),
            params![id],
            map_row_to_instruction,
        )
        .optional()
        .map_err(|e| store_err("get instruction", e))
    }

    /// Role-scoped listing, priority-descending then id-ascending.
    pub fn instructions_by_role(
        &self,
        role: TargetRole,
        target_date: &str,
        statuses: Option<&[InstructionStatus]>,
    ) -> Result<Vec<Instruction>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE role = ?1 AND target_date = ?2 ORDER BY id",
                INSTRUCTION_SELECT
            ))
            .map_err(|e| store_err("prepare instructions by role", e))?;
        let rows = stmt
            .query_map(params![role.as_str(), target_date], map_row_to_instruction)
            .map_err(|e| store_err("query instructions by role", e))?;
        let mut out = collect_rows(rows, "scan instructions by role")?;
        if let Some(statuses) = statuses {
            out.retain(|i| statuses.contains(&i.status));
        }
        out.sort_by(|a, b| b.priority.rank().cmp(&a.priority.rank()).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Pending → Read, recording the read timestamp.
    pub fn mark_instruction_read(&self, id: i64) -> Result<Instruction, EngineError> {
        self.transition_instruction(
            id,
            InstructionStatus::Pending,
            InstructionStatus::Read,
            None,
        )
    }

    /// Read → Done, recording the completion timestamp and feedback.
    pub fn mark_instruction_done(
        &self,
        id: i64,
        feedback: Option<String>,
    ) -> Result<Instruction, EngineError> {
        self.transition_instruction(id, InstructionStatus::Read, InstructionStatus::Done, feedback)
    }

    fn transition_instruction(
        &self,
        id: i64,
        expected: InstructionStatus,
        next: InstructionStatus,
        feedback: Option<String>,
    ) -> Result<Instruction, EngineError> {
        let now = dt_to_ms(Utc::now());
        {
            let conn = self.lock()?;
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM data_instructions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("read instruction status", e))?;
            let Some(current) = current else {
                return Err(EngineError::UnknownEntity(format!("instruction: {}", id)));
            };
            if current != expected.as_str() {
                return Err(EngineError::BadTransition(format!(
                    "instruction {}: {} -> {} not permitted",
                    id,
                    current,
                    next.as_str()
                )));
            }
            // The status guard in the UPDATE serialises concurrent
            // transitions on the same row.
            let updated = match next {
                InstructionStatus::Read => conn
                    .execute(
                        "UPDATE data_instructions SET status = 'Read', read_at_ms = ?2
                         WHERE id = ?1 AND status = 'Pending'",
                        params![id, now],
                    )
                    .map_err(|e| store_err("mark instruction read", e))?,
                InstructionStatus::Done => conn
                    .execute(
                        "UPDATE data_instructions
                         SET status = 'Done', done_at_ms = ?2, feedback = ?3
                         WHERE id = ?1 AND status = 'Read'",
                        params![id, now, feedback],
                    )
                    .map_err(|e| store_err("mark instruction done", e))?,
                InstructionStatus::Pending => 0,
            };
            if updated == 0 {
                return Err(EngineError::BadTransition(format!(
                    "instruction {}: concurrent transition lost",
                    id
                )));
            }
        }
        self.instruction(id)?
            .ok_or_else(|| EngineError::UnknownEntity(format!("instruction: {}", id)))
    }
}

/// Filter for [`SqliteStore::measurements`]; unset fields do not
/// constrain the query.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeasurementFilter<'a> {
    pub batch_id: Option<&'a str>,
    pub node_code: Option<&'a str>,
    pub param_code: Option<&'a str>,
    pub node_codes: Option<&'a [&'a str]>,
    pub batch_ids: Option<&'a [String]>,
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

const INSTRUCTION_SELECT: &str =
    "SELECT id, target_date, role, action_code, batch_id, node_code, param_code,
            content, status, priority, evidence_json, feedback, instruction_type,
            created_at_ms, read_at_ms, done_at_ms
     FROM data_instructions";

fn parse_enum<T>(
    raw: String,
    parse: impl Fn(&str) -> Result<T, EngineError>,
) -> Result<T, rusqlite::Error> {
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })
}

fn map_row_to_node(row: &Row<'_>) -> rusqlite::Result<ProcessNode> {
    Ok(ProcessNode {
        code: row.get(0)?,
        name: row.get(1)?,
        node_type: parse_enum(row.get::<_, String>(2)?, NodeType::from_str)?,
        parent_code: row.get(3)?,
    })
}

fn map_row_to_parameter(row: &Row<'_>) -> rusqlite::Result<ParameterDef> {
    Ok(ParameterDef {
        node_code: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        unit: row.get(3)?,
        role: parse_enum(row.get::<_, String>(4)?, ParamRole::from_str)?,
        usl: row.get(5)?,
        lsl: row.get(6)?,
        target: row.get(7)?,
        data_type: parse_enum(row.get::<_, String>(8)?, ParamDataType::from_str)?,
    })
}

fn map_row_to_action(row: &Row<'_>) -> rusqlite::Result<ActionDef> {
    Ok(ActionDef {
        code: row.get(0)?,
        name: row.get(1)?,
        risk_code: row.get(2)?,
        target_role: parse_enum(row.get::<_, String>(3)?, TargetRole::from_str)?,
        instruction_template: row.get(4)?,
        priority: parse_enum(row.get::<_, String>(5)?, ActionPriority::from_str)?,
        category: row.get(6)?,
        estimated_impact: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
    })
}

fn map_row_to_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get(0)?,
        product_name: row.get(1)?,
        operator_id: row.get(2)?,
        start_time: ms_to_dt(row.get::<_, i64>(3)?),
        end_time: row.get::<_, Option<i64>>(4)?.map(ms_to_dt),
        status: parse_enum(row.get::<_, String>(5)?, BatchStatus::from_str)?,
    })
}

fn map_row_to_measurement(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    Ok(Measurement {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        node_code: row.get(2)?,
        param_code: row.get(3)?,
        value: row.get(4)?,
        timestamp: ms_to_dt(row.get::<_, i64>(5)?),
        source: parse_enum(row.get::<_, String>(6)?, MeasurementSource::from_str)?,
    })
}

fn map_row_to_instruction(row: &Row<'_>) -> rusqlite::Result<Instruction> {
    let evidence_raw: String = row.get(10)?;
    let evidence: Map<String, Value> = serde_json::from_str(&evidence_raw).unwrap_or_default();
    Ok(Instruction {
        id: row.get(0)?,
        target_date: row.get(1)?,
        role: parse_enum(row.get::<_, String>(2)?, TargetRole::from_str)?,
        action_code: row.get(3)?,
        batch_id: row.get(4)?,
        node_code: row.get(5)?,
        param_code: row.get(6)?,
        content: row.get(7)?,
        status: parse_enum(row.get::<_, String>(8)?, InstructionStatus::from_str)?,
        priority: parse_enum(row.get::<_, String>(9)?, ActionPriority::from_str)?,
        evidence,
        feedback: row.get(11)?,
        instruction_type: parse_enum(row.get::<_, String>(12)?, InstructionKind::from_str)?,
        created_at: ms_to_dt(row.get::<_, i64>(13)?),
        read_at: row.get::<_, Option<i64>>(14)?.map(ms_to_dt),
        done_at: row.get::<_, Option<i64>>(15)?.map(ms_to_dt),
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    context: &str,
) -> Result<Vec<T>, EngineError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| store_err(context, e))?);
    }
    Ok(out)
}

fn apply_migration_v1(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "CREATE TABLE meta_process_nodes (
             code TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             node_type TEXT NOT NULL,
             parent_code TEXT
         );
         CREATE TABLE meta_process_flows (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             source_code TEXT NOT NULL,
             target_code TEXT NOT NULL,
             name TEXT,
             loss_rate REAL
         );
         CREATE TABLE meta_parameters (
             node_code TEXT NOT NULL,
             code TEXT NOT NULL,
             name TEXT NOT NULL,
             unit TEXT,
             role TEXT NOT NULL,
             usl REAL,
             lsl REAL,
             target REAL,
             data_type TEXT NOT NULL,
             PRIMARY KEY (node_code, code)
         );
         CREATE TABLE meta_risk_nodes (
             code TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             category TEXT NOT NULL,
             base_probability REAL NOT NULL DEFAULT 0.01
         );
         CREATE TABLE meta_risk_edges (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             source_code TEXT NOT NULL,
             target_code TEXT NOT NULL,
             weight REAL NOT NULL DEFAULT 1.0
         );
         CREATE TABLE meta_actions (
             code TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             risk_code TEXT,
             target_role TEXT NOT NULL,
             instruction_template TEXT NOT NULL,
             priority TEXT NOT NULL,
             category TEXT,
             estimated_impact TEXT,
             active INTEGER NOT NULL DEFAULT 1
         );
         CREATE TABLE data_batches (
             id TEXT PRIMARY KEY,
             product_name TEXT NOT NULL,
             operator_id TEXT,
             start_time_ms INTEGER NOT NULL,
             end_time_ms INTEGER,
             status TEXT NOT NULL DEFAULT 'Running'
         );
         CREATE TABLE data_measurements (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             batch_id TEXT NOT NULL,
             node_code TEXT NOT NULL,
             param_code TEXT NOT NULL,
             value REAL NOT NULL,
             timestamp_ms INTEGER NOT NULL,
             source TEXT NOT NULL
         );
         CREATE INDEX idx_measurements_batch ON data_measurements (batch_id);
         CREATE INDEX idx_measurements_series
             ON data_measurements (node_code, param_code, timestamp_ms);
         CREATE INDEX idx_measurements_time ON data_measurements (timestamp_ms);
         CREATE TABLE data_instructions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             target_date TEXT NOT NULL,
             role TEXT NOT NULL,
             action_code TEXT NOT NULL,
             batch_id TEXT,
             node_code TEXT,
             param_code TEXT,
             content TEXT NOT NULL,
             status TEXT NOT NULL DEFAULT 'Pending',
             priority TEXT NOT NULL,
             evidence_json TEXT NOT NULL DEFAULT '{}',
             feedback TEXT,
             instruction_type TEXT NOT NULL DEFAULT 'tactical',
             created_at_ms INTEGER NOT NULL,
             read_at_ms INTEGER,
             done_at_ms INTEGER
         );",
    )
    .map_err(|e| store_err("apply migration v1", e))
}

fn apply_migration_v2(conn: &Connection) -> Result<(), EngineError> {
    // NULL batch/node legs participate in dedup as empty strings so the
    // unique index sees one row per logical tuple.
    conn.execute_batch(
        "CREATE UNIQUE INDEX idx_instructions_dedup
             ON data_instructions (target_date, role, action_code,
                                   ifnull(batch_id, ''), ifnull(node_code, ''));",
    )
    .map_err(|e| store_err("apply migration v2", e))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| store_err("record migration", e))?;
    Ok(())
}
