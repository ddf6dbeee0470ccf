//! vod-archiver library crate.
//!
//! Archives published videos and live broadcasts, with chat, from a
//! streaming platform. The binary wires these modules together; the
//! integration tests drive them with fake actions.

pub mod actions;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod pipeline;
pub mod platform;
pub mod substrate;
pub mod utils;

pub use error::{Error, Result};
