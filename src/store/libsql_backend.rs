//! libSQL backend for the pipeline store.
//!
//! Each transaction gets its own connection. Reads run in autocommit mode
//! until the first write or `lock_*` call, which opens a `BEGIN IMMEDIATE`
//! transaction holding the database write lock until commit or rollback.
//! Execution records and summary metrics are stored as JSON text columns.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::model::{
    InstanceId, InstanceState, PipelineInstance, PipelineStage, PipelineTask,
    ProcessingAttributes, StageDefinition, StageId, TaskCounts, TaskId, TaskState, UnitOfWork,
};
use crate::store::migrations;
use crate::store::traits::{PipelineStore, StoreTransaction};

/// How long a transaction waits for the write lock before failing.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const INSTANCE_COLUMNS: &str =
    "id, name, priority, state, start_processing_time, end_processing_time";

const STAGE_COLUMNS: &str = "id, instance_id, position, module_name, min_memory_mb, \
     start_new_uow, remote_execution, units_of_work, num_tasks, num_submitted, \
     num_completed, num_failed";

const TASK_COLUMNS: &str = "id, instance_id, stage_id, state, worker_host, worker_thread, \
     software_revision, start_processing_time, end_processing_time, failure_count, \
     transition_complete, restart_mode, retry, uow, exec_log, processing_state, \
     total_subtasks, completed_subtasks, failed_subtasks, summary_metrics";

/// libSQL-backed [`PipelineStore`].
pub struct LibSqlStore {
    db: Arc<LibSqlDatabase>,
    busy_timeout: Duration,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        let conn = store.connect()?;
        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Pipeline database opened");
        Ok(store)
    }

    /// Override how long transactions wait for the write lock.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn connect(&self) -> Result<Connection, DatabaseError> {
        self.db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))
    }
}

#[async_trait]
impl PipelineStore for LibSqlStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let conn = self.connect()?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        Ok(Box::new(LibSqlTransaction {
            conn,
            active: false,
        }))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn format_optional_datetime(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| d.to_rfc3339())
}

fn row_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn row_to_instance(row: &libsql::Row) -> Result<PipelineInstance, DatabaseError> {
    let err = row_err("instance");
    let state: String = row.get(3).map_err(&err)?;
    Ok(PipelineInstance {
        id: InstanceId(row.get(0).map_err(&err)?),
        name: row.get(1).map_err(&err)?,
        priority: row.get::<u32>(2).map_err(&err)? as u8,
        state: parse_enum::<InstanceState>(&state)?,
        start_processing_time: parse_optional_datetime(row.get(4).map_err(&err)?),
        end_processing_time: parse_optional_datetime(row.get(5).map_err(&err)?),
    })
}

fn row_to_stage(row: &libsql::Row) -> Result<PipelineStage, DatabaseError> {
    let err = row_err("stage");
    let uows: String = row.get(7).map_err(&err)?;
    Ok(PipelineStage {
        id: StageId(row.get(0).map_err(&err)?),
        instance_id: InstanceId(row.get(1).map_err(&err)?),
        position: row.get(2).map_err(&err)?,
        module_name: row.get(3).map_err(&err)?,
        min_memory_mb: row.get(4).map_err(&err)?,
        start_new_uow: row.get::<i64>(5).map_err(&err)? != 0,
        remote_execution: row.get::<i64>(6).map_err(&err)? != 0,
        units_of_work: from_json(&uows)?,
        counts: TaskCounts {
            total: row.get(8).map_err(&err)?,
            submitted: row.get(9).map_err(&err)?,
            completed: row.get(10).map_err(&err)?,
            failed: row.get(11).map_err(&err)?,
        },
    })
}

fn row_to_task(row: &libsql::Row) -> Result<PipelineTask, DatabaseError> {
    let err = row_err("task");
    let state: String = row.get(3).map_err(&err)?;
    let uow: String = row.get(13).map_err(&err)?;
    let exec_log: String = row.get(14).map_err(&err)?;
    let processing_state: String = row.get(15).map_err(&err)?;
    let metrics: String = row.get(19).map_err(&err)?;
    Ok(PipelineTask {
        id: TaskId(row.get(0).map_err(&err)?),
        instance_id: InstanceId(row.get(1).map_err(&err)?),
        stage_id: StageId(row.get(2).map_err(&err)?),
        state: parse_enum::<TaskState>(&state)?,
        worker_host: row.get(4).map_err(&err)?,
        worker_thread: row.get(5).map_err(&err)?,
        software_revision: row.get(6).map_err(&err)?,
        start_processing_time: parse_optional_datetime(row.get(7).map_err(&err)?),
        end_processing_time: parse_optional_datetime(row.get(8).map_err(&err)?),
        failure_count: row.get(9).map_err(&err)?,
        transition_complete: row.get::<i64>(10).map_err(&err)? != 0,
        restart_mode: row.get(11).map_err(&err)?,
        retry: row.get::<i64>(12).map_err(&err)? != 0,
        uow: UnitOfWork(from_json(&uow)?),
        exec_log: from_json(&exec_log)?,
        attributes: ProcessingAttributes {
            state: parse_enum(&processing_state)?,
            total_subtasks: row.get(16).map_err(&err)?,
            completed_subtasks: row.get(17).map_err(&err)?,
            failed_subtasks: row.get(18).map_err(&err)?,
        },
        summary_metrics: from_json(&metrics)?,
    })
}

// ── Transaction ─────────────────────────────────────────────────────

/// Transaction over a [`LibSqlStore`].
pub struct LibSqlTransaction {
    conn: Connection,
    /// Whether `BEGIN IMMEDIATE` has been issued on this connection.
    active: bool,
}

impl LibSqlTransaction {
    async fn begin_write(&mut self) -> Result<(), DatabaseError> {
        if !self.active {
            self.conn
                .execute("BEGIN IMMEDIATE", ())
                .await
                .map_err(|e| DatabaseError::Transaction(format!("BEGIN IMMEDIATE: {e}")))?;
            self.active = true;
        }
        Ok(())
    }

    async fn query_one<T>(
        &self,
        op: &'static str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn query_all<T>(
        &self,
        op: &'static str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(map(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }

    async fn execute(
        &mut self,
        op: &'static str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.begin_write().await?;
        self.conn
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }
}

#[async_trait]
impl StoreTransaction for LibSqlTransaction {
    async fn create_instance(
        &mut self,
        name: &str,
        priority: u8,
    ) -> Result<PipelineInstance, DatabaseError> {
        self.execute(
            "create_instance",
            "INSERT INTO pipeline_instances (name, priority, state) VALUES (?1, ?2, ?3)",
            params![name, priority as i64, InstanceState::Initialized.as_str()],
        )
        .await?;
        let id = InstanceId(self.conn.last_insert_rowid());
        debug!(instance_id = %id, "Instance inserted");
        Ok(PipelineInstance {
            id,
            name: name.to_string(),
            priority,
            state: InstanceState::Initialized,
            start_processing_time: None,
            end_processing_time: None,
        })
    }

    async fn instance(&mut self, id: InstanceId) -> Result<Option<PipelineInstance>, DatabaseError> {
        self.query_one(
            "instance",
            &format!("SELECT {INSTANCE_COLUMNS} FROM pipeline_instances WHERE id = ?1"),
            params![id.0],
            row_to_instance,
        )
        .await
    }

    async fn lock_instance(
        &mut self,
        id: InstanceId,
    ) -> Result<Option<PipelineInstance>, DatabaseError> {
        self.begin_write().await?;
        self.instance(id).await
    }

    async fn save_instance(&mut self, instance: &PipelineInstance) -> Result<(), DatabaseError> {
        let updated = self
            .execute(
                "save_instance",
                "UPDATE pipeline_instances SET name = ?1, priority = ?2, state = ?3, \
                 start_processing_time = ?4, end_processing_time = ?5 WHERE id = ?6",
                params![
                    instance.name.clone(),
                    instance.priority as i64,
                    instance.state.as_str(),
                    format_optional_datetime(instance.start_processing_time),
                    format_optional_datetime(instance.end_processing_time),
                    instance.id.0
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::instance_not_found(instance.id));
        }
        Ok(())
    }

    async fn create_stage(
        &mut self,
        instance_id: InstanceId,
        position: u32,
        definition: &StageDefinition,
        total: u32,
    ) -> Result<PipelineStage, DatabaseError> {
        let uows = to_json(&definition.units_of_work)?;
        self.execute(
            "create_stage",
            "INSERT INTO pipeline_stages (instance_id, position, module_name, min_memory_mb, \
             start_new_uow, remote_execution, units_of_work, num_tasks) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                instance_id.0,
                position as i64,
                definition.module_name.clone(),
                definition.min_memory_mb as i64,
                definition.start_new_uow as i64,
                definition.remote_execution as i64,
                uows,
                total as i64
            ],
        )
        .await?;
        Ok(PipelineStage {
            id: StageId(self.conn.last_insert_rowid()),
            instance_id,
            position,
            module_name: definition.module_name.clone(),
            min_memory_mb: definition.min_memory_mb,
            start_new_uow: definition.start_new_uow,
            remote_execution: definition.remote_execution,
            units_of_work: definition.units_of_work.clone(),
            counts: TaskCounts {
                total,
                ..TaskCounts::default()
            },
        })
    }

    async fn stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError> {
        self.query_one(
            "stage",
            &format!("SELECT {STAGE_COLUMNS} FROM pipeline_stages WHERE id = ?1"),
            params![id.0],
            row_to_stage,
        )
        .await
    }

    async fn lock_stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError> {
        self.begin_write().await?;
        self.stage(id).await
    }

    async fn stages_for_instance(
        &mut self,
        instance_id: InstanceId,
    ) -> Result<Vec<PipelineStage>, DatabaseError> {
        self.query_all(
            "stages_for_instance",
            &format!(
                "SELECT {STAGE_COLUMNS} FROM pipeline_stages WHERE instance_id = ?1 ORDER BY position ASC"
            ),
            params![instance_id.0],
            row_to_stage,
        )
        .await
    }

    async fn save_stage(&mut self, stage: &PipelineStage) -> Result<(), DatabaseError> {
        let updated = self
            .execute(
                "save_stage",
                "UPDATE pipeline_stages SET num_tasks = ?1, num_submitted = ?2, \
                 num_completed = ?3, num_failed = ?4 WHERE id = ?5",
                params![
                    stage.counts.total as i64,
                    stage.counts.submitted as i64,
                    stage.counts.completed as i64,
                    stage.counts.failed as i64,
                    stage.id.0
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::stage_not_found(stage.id));
        }
        Ok(())
    }

    async fn create_task(
        &mut self,
        instance_id: InstanceId,
        stage_id: StageId,
        uow: &UnitOfWork,
    ) -> Result<PipelineTask, DatabaseError> {
        self.execute(
            "create_task",
            "INSERT INTO pipeline_tasks (instance_id, stage_id, state, uow) VALUES (?1, ?2, ?3, ?4)",
            params![
                instance_id.0,
                stage_id.0,
                TaskState::Initialized.as_str(),
                to_json(uow)?
            ],
        )
        .await?;
        let id = TaskId(self.conn.last_insert_rowid());
        Ok(PipelineTask::new(id, instance_id, stage_id, uow.clone()))
    }

    async fn task(&mut self, id: TaskId) -> Result<Option<PipelineTask>, DatabaseError> {
        self.query_one(
            "task",
            &format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE id = ?1"),
            params![id.0],
            row_to_task,
        )
        .await
    }

    async fn tasks_for_stage(
        &mut self,
        stage_id: StageId,
    ) -> Result<Vec<PipelineTask>, DatabaseError> {
        self.query_all(
            "tasks_for_stage",
            &format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE stage_id = ?1 ORDER BY id ASC"),
            params![stage_id.0],
            row_to_task,
        )
        .await
    }

    async fn processing_tasks_on_host(
        &mut self,
        host: &str,
    ) -> Result<Vec<PipelineTask>, DatabaseError> {
        self.query_all(
            "processing_tasks_on_host",
            &format!(
                "SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE worker_host = ?1 AND state = ?2 ORDER BY id ASC"
            ),
            params![host, TaskState::Processing.as_str()],
            row_to_task,
        )
        .await
    }

    async fn submitted_tasks(&mut self) -> Result<Vec<PipelineTask>, DatabaseError> {
        self.query_all(
            "submitted_tasks",
            &format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE state = ?1 ORDER BY id ASC"),
            params![TaskState::Submitted.as_str()],
            row_to_task,
        )
        .await
    }

    async fn save_task(&mut self, task: &PipelineTask) -> Result<(), DatabaseError> {
        let exec_log = to_json(&task.exec_log)?;
        let uow = to_json(&task.uow)?;
        let metrics = to_json(&task.summary_metrics)?;
        let updated = self
            .execute(
                "save_task",
                "UPDATE pipeline_tasks SET state = ?1, worker_host = ?2, worker_thread = ?3, \
                 software_revision = ?4, start_processing_time = ?5, end_processing_time = ?6, \
                 failure_count = ?7, transition_complete = ?8, restart_mode = ?9, retry = ?10, \
                 uow = ?11, exec_log = ?12, processing_state = ?13, total_subtasks = ?14, \
                 completed_subtasks = ?15, failed_subtasks = ?16, summary_metrics = ?17 \
                 WHERE id = ?18",
                params![
                    task.state.as_str(),
                    task.worker_host.clone(),
                    task.worker_thread.map(i64::from),
                    task.software_revision.clone(),
                    format_optional_datetime(task.start_processing_time),
                    format_optional_datetime(task.end_processing_time),
                    task.failure_count as i64,
                    task.transition_complete as i64,
                    task.restart_mode.clone(),
                    task.retry as i64,
                    uow,
                    exec_log,
                    task.attributes.state.as_str(),
                    task.attributes.total_subtasks as i64,
                    task.attributes.completed_subtasks as i64,
                    task.attributes.failed_subtasks as i64,
                    metrics,
                    task.id.0
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::task_not_found(task.id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        if self.active {
            self.conn
                .execute("COMMIT", ())
                .await
                .map_err(|e| DatabaseError::Transaction(format!("COMMIT: {e}")))?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        if self.active {
            self.conn
                .execute("ROLLBACK", ())
                .await
                .map_err(|e| DatabaseError::Transaction(format!("ROLLBACK: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{ProcessingState, TaskExecutionLog};

    async fn test_store() -> (LibSqlStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LibSqlStore::new_local(&dir.path().join("pipeline.db"))
            .await
            .unwrap();
        (store, dir)
    }

    async fn seed(store: &LibSqlStore) -> (PipelineInstance, PipelineStage, PipelineTask) {
        let mut tx = store.begin().await.unwrap();
        let instance = tx.create_instance("pdc", 1).await.unwrap();
        let definition = StageDefinition::new("pdc")
            .with_units_of_work(vec![UnitOfWork::new(serde_json::json!({"brief": "ccd-1"}))])
            .with_min_memory_mb(512);
        let stage = tx.create_stage(instance.id, 0, &definition, 1).await.unwrap();
        let task = tx
            .create_task(instance.id, stage.id, &definition.units_of_work[0])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (instance, stage, task)
    }

    #[tokio::test]
    async fn instance_stage_task_round_trip() {
        let (store, _dir) = test_store().await;
        let (instance, stage, task) = seed(&store).await;

        let mut tx = store.begin().await.unwrap();
        let fetched = tx.require_instance(instance.id).await.unwrap();
        assert_eq!(fetched, instance);

        let stages = tx.stages_for_instance(instance.id).await.unwrap();
        assert_eq!(stages, vec![stage.clone()]);
        assert_eq!(stages[0].min_memory_mb, 512);

        let fetched = tx.require_task(task.id).await.unwrap();
        assert_eq!(fetched.uow.brief_state(), "ccd-1");
        assert_eq!(fetched.state, TaskState::Initialized);
    }

    #[tokio::test]
    async fn save_task_persists_exec_log_and_metrics() {
        let (store, _dir) = test_store().await;
        let (_, _, mut task) = seed(&store).await;

        task.state = TaskState::Processing;
        task.worker_host = Some("node-7".into());
        task.worker_thread = Some(3);
        task.start_processing_time = Some(Utc::now());
        task.exec_log.push(TaskExecutionLog::start("node-7", 3, &task));
        task.attributes.state = ProcessingState::Executing;
        task.summary_metrics.insert("processing_ms".into(), 42.0);

        let mut tx = store.begin().await.unwrap();
        tx.save_task(&task).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let fetched = tx.require_task(task.id).await.unwrap();
        assert_eq!(fetched.exec_log.len(), 1);
        assert_eq!(fetched.exec_log[0].worker_host, "node-7");
        assert_eq!(fetched.attributes.state, ProcessingState::Executing);
        assert_eq!(fetched.summary_metrics["processing_ms"], 42.0);
        assert_eq!(fetched.worker_thread, Some(3));

        let on_host = tx.processing_tasks_on_host("node-7").await.unwrap();
        assert_eq!(on_host.len(), 1);
        assert!(tx.submitted_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (store, _dir) = test_store().await;
        let (_, mut stage, _) = seed(&store).await;

        let mut tx = store.begin().await.unwrap();
        stage.counts.failed = 1;
        tx.save_stage(&stage).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let fetched = tx.require_stage(stage.id).await.unwrap();
        assert_eq!(fetched.counts.failed, 0);
    }

    #[tokio::test]
    async fn save_missing_task_is_not_found() {
        let (store, _dir) = test_store().await;
        let (instance, stage, _) = seed(&store).await;
        let ghost = PipelineTask::new(TaskId(999), instance.id, stage.id, UnitOfWork::default());

        let mut tx = store.begin().await.unwrap();
        let result = tx.save_task(&ghost).await;
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn read_only_transaction_commits_without_begin() {
        let (store, _dir) = test_store().await;
        let (instance, _, _) = seed(&store).await;

        let mut tx = store.begin().await.unwrap();
        tx.instance(instance.id).await.unwrap();
        tx.commit().await.unwrap();
    }
}
