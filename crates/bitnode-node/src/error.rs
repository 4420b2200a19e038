/// Node error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to initialize the logger: {0}")]
    Logger(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] bitnode_storage::Error),
    #[error(transparent)]
    Chain(#[from] bitnode_chain::Error),
    #[error(transparent)]
    Network(#[from] bitnode_network::Error),
}
