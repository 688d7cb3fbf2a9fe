pub mod client;
pub mod errors;
pub mod http;
pub mod mock;
pub mod retry;
pub mod types;
pub mod wire;

pub use client::RemoteService;
pub use errors::{ApiError, ApiResult};
pub use http::HttpRemoteService;
pub use mock::{InMemoryService, RunScript};
pub use retry::{RetryConfig, RetryHandler};
