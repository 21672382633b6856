//! # tunstack core
//!
//! Platform-independent core of the TUN interception stack.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Interface registry** - Process-wide snapshot of host interfaces
//! - **Outbound binding** - Pin upstream sockets to a physical interface
//! - **Routing** - Reversible policy routing around the virtual device
//! - **Stack attachment** - Bridge a userspace TCP/IP stack to the device
//! - **Dispatch** - Bounded queues feeding per-connection workers
//!
//! Platform specifics (device I/O, kernel routing commands, socket options)
//! come in through the traits defined here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunstack_core::{Config, TunNetstack};
//! # fn backend() -> Box<dyn tunstack_core::netstack::Backend> { unimplemented!() }
//! # fn handler() -> Arc<dyn tunstack_core::ConnHandler> { unimplemented!() }
//!
//! # async fn run() -> tunstack_core::Result<()> {
//! let config = Config::load("tunstack.toml")?;
//! let mut netstack = TunNetstack::new(config.tun, config.dispatch.queue_capacity, backend());
//! netstack.register_conn_handler(handler());
//! netstack.start()?;
//! // ... serve until interrupted
//! netstack.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bind;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod iface;
pub mod net;
pub mod netstack;
pub mod routing;
pub mod stack;

// Re-exports for convenience
pub use config::{Config, TunConfig};
pub use conn::{ConnHandler, ConnTuple, Connection, DatagramConn, StreamConn};
pub use dispatch::{AcceptSink, Dispatcher};
pub use error::{Error, Result};
pub use iface::{Interface, Registry};
pub use net::Family;
pub use netstack::TunNetstack;
