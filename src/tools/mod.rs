//! 工具层：Tool 契约、注册表、调度执行器与本地协作工具

pub mod calculator;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod think;

pub use calculator::CalculatorTool;
pub use executor::{reconcile, DispatchMode, ToolExecutor, ToolOutcome};
pub use filesystem::{FileReadTool, FileWriteTool, FsError, SafeFs};
pub use registry::{Tool, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry};
pub use schema::input_schema;
pub use think::ThinkTool;
