//! Concrete [`crate::router::Handler`] implementations owned by the core
//! (as opposed to a simulator).

pub mod core_handler;

pub use core_handler::CoreHandler;
