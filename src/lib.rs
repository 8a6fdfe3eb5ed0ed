//! A programmatic debugging broker: spawns a Debug Adapter Protocol
//! adapter, drives its startup handshake, and exposes a small set of
//! session operations (breakpoints, stepping, locals, event waits)
//! over a resilient, single-session orchestrator.

pub mod cache;
pub mod codec;
pub mod config;
pub mod dap_types;
pub mod errors;
pub mod mock_adapter;
pub mod orchestrator;
pub mod resolver;
pub mod supervisor;
pub mod transport;
