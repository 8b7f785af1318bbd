//! tether-core: message contract, wire framing, and configuration shared by
//! the edge node and its tools. No async runtime lives here.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{ContractError, Envelope, Message, MessageKind, Payload};
