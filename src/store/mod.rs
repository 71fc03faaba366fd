// Durable session state: hierarchical parameter store and its file persistence.

pub mod parameters;
pub mod persist;
