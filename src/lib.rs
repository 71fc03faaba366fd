pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod source;
pub mod store;

pub use error::{Error, Result, Status};
