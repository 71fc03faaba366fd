pub mod manager_api;
pub mod simple;
