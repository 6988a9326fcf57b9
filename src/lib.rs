//! twoway - bidirectional byte-stream relay.
//!
//! Opens two addresses (sockets, files, spawned processes, pseudo-terminals,
//! the standard streams or a line-editing console) and copies bytes between
//! them until both directions are closed.
//!
//! # Architecture
//!
//! - **Option table** - static catalog of `,name=value` options, delivered
//!   to an address in lifecycle phases
//! - **Address registry** - static catalog of address types and their open
//!   entry points
//! - **Endpoint** - one opened address; owns its descriptors and cleanup
//! - **Hooks** - per-endpoint read and write-observed hooks (line editing)
//! - **Relay** - single-threaded `poll(2)` loop driving two endpoints
//! - **Diagnostics** - leveled logging behind the `log` facade, with
//!   exit-on-severity
//!
//! # Modules
//!
//! - [`address`] - address parsing, registry and address types
//! - [`option`] - option descriptors and phased application
//! - [`endpoint`] - opened addresses
//! - [`hook`] - I/O hooks and the line-editing behavior
//! - [`relay`] - the transfer loop
//! - [`diag`] - diagnostics service

// Library modules
pub mod address;
pub mod config;
pub mod constants;
pub mod diag;
pub mod editor;
pub mod endpoint;
pub mod error;
pub mod hook;
pub mod option;
pub mod process;
pub mod relay;
pub mod signals;
pub mod terminal;

// Re-export commonly used types
pub use address::{resolve_and_open, Direction};
pub use config::{Flow, RelayConfig};
pub use endpoint::Endpoint;
pub use error::OpenError;
pub use relay::{Relay, RelayError, RelayOutcome};
pub use signals::ShutdownSignal;
