#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod bus;
pub mod connection;
mod error;
pub mod gossip;
pub mod media;
pub mod message;
pub mod origin;
pub mod peer;
pub mod transport;

pub use error::{Error, Result};
