pub mod connection;
mod pending;

pub use connection::ConnectionPhase;
pub use pending::{Outcome, PendingCommands, TrackedCommand};
