#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("socket handle {0} is out of range")]
    InvalidSocket(i32),

    #[error("no free socket slots")]
    NoFreeSocket,

    #[error("no free ephemeral port available")]
    NoFreeEphemeralPort,

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("connection illegal for this process")]
    IllegalForState,

    #[error("connection closing")]
    ConnectionClosing,

    #[error("connection reset by peer")]
    Reset,

    #[error("no route to peer")]
    NoRoute,

    #[error("I/O error talking to the IP layer: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
