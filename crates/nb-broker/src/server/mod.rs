//! Control-connection server: listener and per-connection handler

pub mod handler;
pub mod listener;

pub use handler::handle_control_connection;
pub use listener::ControlServer;
