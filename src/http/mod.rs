//! Daemon HTTP surface

pub mod handler;
pub mod server;

pub use server::{router, AppState, HttpServer};
