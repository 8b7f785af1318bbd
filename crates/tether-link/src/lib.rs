//! tether-link: socket plumbing for both connection roles.
//!
//! [`RemoteConnection`] is the edge node's outbound, self-healing link to the
//! cloud node. [`CommandListener`] accepts cloud-issued commands and hands
//! each one to a [`CommandHandler`].

pub mod error;
pub mod listener;
pub mod remote;

pub use error::LinkError;
pub use listener::{CommandHandler, CommandListener, ConnectionWriter, Reply};
pub use remote::{Backoff, ConnectionState, LinkSettings, RemoteConnection};
