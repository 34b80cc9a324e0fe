/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a worker execution context within one pool.
///
/// Ids are never reused: a replacement context gets a fresh id.
pub type WorkerId = u32;
