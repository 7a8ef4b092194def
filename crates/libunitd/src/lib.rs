//! `libunitd` is the core library of the unitd service manager. It holds
//! everything the manager binary (`unitd`) and the control tool
//! (`unitctl`) share:
//!
//! - unit name escaping and template handling
//! - the condition evaluator gating unit activation
//! - the fragment loader (sectioned key=value files, aliases, masking)
//! - the unit registry and dependency graph
//! - per-type unit state machines
//! - the fd store holding unit-owned listen fds across re-execution
//! - the transaction builder and job engine
//! - the manager loop and its serialization across re-execution
//! - the control interface (JSON-RPC 2.0 over a unix socket)

pub mod broker;
pub mod conditions;
pub mod config;
pub mod control;
pub mod entrypoints;
pub mod fd_store;
pub mod jobs;
pub mod logging;
pub mod manager;
pub mod serialization;
pub mod signal_handler;
pub mod sockets;
pub mod unit_name;
pub mod units;

#[cfg(test)]
mod tests;
