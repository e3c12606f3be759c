pub mod config;
pub mod err;
pub mod ip;
pub mod stack;
pub mod tcp;
mod timer;

pub use config::StackConfig;
pub use err::{Error, Result};
pub use ip::{IfaceId, IpLayer, LoopbackIpLayer, RawDatagram, TunIpLayer};
pub use stack::NetStack;
