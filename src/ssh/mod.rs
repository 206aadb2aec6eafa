pub mod command;
pub mod connection;
pub mod fake;
pub mod pool;
pub mod session;
pub mod target;
pub mod transport;

pub use command::*;
pub use connection::Ssh2Connector;
pub use pool::SessionPool;
pub use session::*;
pub use target::*;
pub use transport::*;
