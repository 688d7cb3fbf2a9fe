pub mod client;

pub use client::{RateLimit, RateLimitedHttpClient};
