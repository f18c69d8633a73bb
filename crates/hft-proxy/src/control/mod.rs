//! Control plane: line-delimited JSON port allocation over TCP.

pub mod server;

pub use server::{respond, ControlServer};
