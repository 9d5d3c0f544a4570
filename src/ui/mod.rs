//! JSON status API

pub mod handlers;
pub mod server;

pub use server::{AppState, WebServer};
