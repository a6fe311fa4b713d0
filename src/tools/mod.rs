//! 工具层：注册表、执行器与内置工具

pub mod artifact_read;
pub mod echo;
pub mod executor;
pub mod registry;

pub use artifact_read::ArtifactReadTool;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
