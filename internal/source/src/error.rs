use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("activity {0} does not exist")]
    NoActivity(String),

    #[error("item {path} does not exist at revision {revision}")]
    NotFound { path: String, revision: i64 },

    #[error("no version of item {path} precedes revision {revision}")]
    NoPreviousVersion { path: String, revision: i64 },

    #[error("upstream call failed: {0}")]
    Upstream(String),
}
