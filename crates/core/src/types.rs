/// Jobs are identified by UUIDs (v7 when generated by the engine).
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, time-ordered job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7()
}
