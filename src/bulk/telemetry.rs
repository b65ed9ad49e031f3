//! Import telemetry events.
//!
//! Each table import posts a start event, progress events as the per-file
//! row count crosses each new million-row boundary, a termination event on
//! failure, and a summary event on success.

use uuid::Uuid;

/// Kind of telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleEventKind {
    Start,
    Progress,
    Term,
    Summary,
}

/// One import telemetry record.
#[derive(Debug, Clone)]
pub struct ImportTeleStats {
    pub kind: TeleEventKind,
    pub job_uuid: Uuid,
    pub import_uuid: Uuid,
    pub table_list: Vec<String>,
    pub rows_so_far: Vec<u64>,
    pub schema_name: String,
    pub system_name: String,
    pub module_name: String,
    /// Milliseconds since the Unix epoch.
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
}

impl ImportTeleStats {
    pub fn start(job_uuid: Uuid, table_name: &str, system_name: &str, module_name: &str) -> Self {
        let schema_name = table_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            kind: TeleEventKind::Start,
            job_uuid,
            import_uuid: Uuid::new_v4(),
            table_list: vec![table_name.to_string()],
            rows_so_far: vec![0],
            schema_name,
            system_name: system_name.to_string(),
            module_name: module_name.to_string(),
            start_time_ms: chrono::Utc::now().timestamp_millis(),
            end_time_ms: None,
        }
    }

    /// Re-stamp this record as a new event with the given row count.
    pub fn event(&self, kind: TeleEventKind, rows: u64) -> Self {
        let mut out = self.clone();
        out.kind = kind;
        out.rows_so_far = vec![rows];
        if kind == TeleEventKind::Summary {
            out.end_time_ms = Some(chrono::Utc::now().timestamp_millis());
        }
        out
    }
}

/// Telemetry sink.  Failures are advisory and must never fail the import.
pub trait TeleClient: Send + Sync {
    fn post_import(&self, stats: &ImportTeleStats);
}

/// Default sink: telemetry goes to the log at debug level.
#[derive(Debug, Default)]
pub struct LogTeleClient;

impl TeleClient for LogTeleClient {
    fn post_import(&self, stats: &ImportTeleStats) {
        log::debug!(
            "import telemetry: {:?} job={} import={} tables={:?} rows={:?}",
            stats.kind,
            stats.job_uuid,
            stats.import_uuid,
            stats.table_list,
            stats.rows_so_far
        );
    }
}
