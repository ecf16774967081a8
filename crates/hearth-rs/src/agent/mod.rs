//! Agent runtime: the reference turn loop and its configuration.
//!
//! - [`turn::TurnRunner`]: runs one user turn as a task and streams its
//!   events. Start here.
//! - [`config`]: [`TurnConfig`] and the [`Toggle`] wrapper used for
//!   optional modules.

pub mod config;
pub mod turn;

pub use config::{Toggle, TurnConfig};
pub use turn::{TurnError, TurnRunner, TurnStream};
