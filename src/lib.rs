pub mod api;
pub mod config;
pub mod frontend;
pub mod history;
pub mod logging;
pub mod permissions;
pub mod session;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;
