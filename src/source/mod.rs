// Download transport: the backend contract and its HTTP implementation.

pub mod http_source;
pub mod progress;
pub mod traits;
