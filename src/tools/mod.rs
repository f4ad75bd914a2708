pub mod executor;
pub mod gateway;
pub mod plugins;
pub mod registry;

pub use executor::ToolSandbox;
pub use gateway::{ToolGateway, ToolOutcome};
pub use registry::{builtin_tools, ToolRegistry, ToolSpec};
