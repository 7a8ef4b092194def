//! The control surface: the manager's RPC bus, spoken as JSON-RPC 2.0 over
//! a unix stream socket.

mod interface;

pub mod jsonrpc2;

pub use interface::*;
