use thiserror::Error;
use tokio::task;

#[derive(Debug, Error)]
pub enum Error {
    #[error("loader cancelled")]
    Cancelled,

    #[error("production deadline exceeded while waiting to dispatch a fetch")]
    ProductionTimeout,

    #[error("consumption deadline exceeded while waiting for buffer space")]
    ConsumptionTimeout,

    #[error("no item named {0} is tracked by this loader")]
    UnknownItem(String),

    #[error(transparent)]
    Worker(#[from] task::JoinError),

    #[error("every fetch worker exited before production finished")]
    WorkersExited,
}
