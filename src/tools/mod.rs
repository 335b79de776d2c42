pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;

pub use echo::EchoTool;
pub use executor::{classify_payload, ToolExecutor, ToolFailure, ToolReply, TOKENS_USED_FIELD};
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use registry::{Tool, ToolCatalog, ToolRegistry, ToolSpec};
