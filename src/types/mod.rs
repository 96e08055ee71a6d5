//! Plain MCP data records.
//!
//! These are the values exchanged by clients and servers: tool, resource and
//! prompt definitions, content blocks, roots, sampling payloads, completions
//! and task records. They carry no behavior beyond their serde codec.

pub mod completion;
pub mod prompt;
pub mod resource;
pub mod root;
pub mod sampling;
pub mod task;
pub mod tool;

// Re-export commonly used types
pub use completion::*;
pub use prompt::*;
pub use resource::*;
pub use root::*;
pub use sampling::*;
pub use task::*;
pub use tool::*;
