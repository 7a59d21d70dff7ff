pub mod approvals;
pub mod assets;
pub mod logging;
pub mod shell;
pub mod text;
pub mod tool_signature;
