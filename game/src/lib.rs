#![warn(rust_2018_idioms)]

//! Live lobby sessions for a judge-and-players party card game.
//!
//! A `server::Core` keeps one hub task per active lobby. Clients connect
//! through `Core::connect`, submit `protocol::Action`s and receive
//! `protocol::Notification`s; the hub owns the lobby's `table::Table` and
//! persists every card move through a `store::Store`.

pub mod error;
mod hand;
mod hub;
pub mod memory;
pub mod model;
mod pool;
pub mod protocol;
pub mod round;
pub mod server;
pub mod store;
pub mod table;

pub use error::{Error, ErrorKind, Result};
pub use hand::{Hand, HandManager, Refill};
pub use pool::{CardPool, Drawn};
