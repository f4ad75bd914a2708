pub mod classify;
pub mod client;
#[cfg(test)]
pub mod mock_client;
pub mod sse;

pub use client::ApiClient;
