use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] svn_bridge_source::Error),
}
