//! Core engine for the netbench two-party network micro-benchmark.
//!
//! The crate holds everything both roles of the benchmark share and that
//! does not touch a particular transport:
//!
//! - [`codec`]: the big-endian wire codec all control messages use
//! - [`wire`]: the request and RDMA connection-context layouts
//! - [`control`]: the TCP control channel — request, barriers, statistics
//! - [`params`]: the negotiated parameter table with set/use/validate
//! - [`stats`]: four-role transfer counters and time samples
//! - [`clock`]: timestamp sampling and the duration alarm
//! - [`error`]: the error taxonomy shared by engine and drivers
//!
//! A test run wires these together in a fixed order: the client ships a
//! [`wire::Request`] over the [`control::Control`] channel, both sides set
//! up their transport, meet at [`control::Control::sync_test`], run their
//! measurement loop until [`clock::finished`] flips, and finish with one
//! symmetric [`control::Control::exchange_results`].

pub mod clock;
pub mod codec;
pub mod control;
pub mod error;
pub mod params;
pub mod stats;
pub mod wire;

pub use control::{Control, DEFAULT_CONTROL_PORT};
pub use error::{Error, Result};
pub use params::{ParamId, ParamTable};
pub use stats::{Stat, UStat};
pub use wire::{ConnContext, Request, Version};
