use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or process tables could not be read, retried on the next poll.
    #[error("connection discovery failed: {0}")]
    Discovery(String),
    #[error("packet capture failed: {0}")]
    Capture(String),
    /// Gateway could not be resolved, the engine stays on the ip layer.
    #[error("gateway resolution failed: {0}")]
    Resolution(String),
    #[error("could not send segment: {0}")]
    Transmission(String),
    #[error("reachability probe for {addr} failed: {source}")]
    Probe {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid segment: {0}")]
    InvalidSegment(&'static str),
    #[error("no connection to the game server")]
    NoConnection,
    #[error("triggered again within the debounce window")]
    Debounced,
    #[error("engine has been stopped")]
    Stopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}
