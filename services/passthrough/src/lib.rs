pub mod error;
pub mod proxy;
pub mod snapshot;

pub use error::DispatchError;
pub use proxy::{
    Authorization, Listener, ListenerConfig, ProxyHeader, RelayOutcome, Session, TcpProxy,
    TcpServer,
};
pub use snapshot::{Configuration, Location, Server, Snapshot, SnapshotStore, Whitelist};
