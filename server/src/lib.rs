#![warn(rust_2018_idioms)]

pub mod seed;
pub mod settings;

mod server;

pub use server::{run, BoxError, Stats};
