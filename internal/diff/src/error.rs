use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] svn_bridge_cache::Error),

    #[error("no previous version of {path} before revision {revision}")]
    NoPreviousVersion { path: String, revision: i64 },

    #[error(transparent)]
    Source(#[from] svn_bridge_source::Error),
}
