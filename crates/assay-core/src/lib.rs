//! assay-core: tool model, job descriptors, scatter expansion and command
//! templating. All other assay crates depend on this one.

pub mod config;
pub mod hash;
pub mod io;
pub mod matcher;
pub mod scatter;
pub mod template;
pub mod tool;

pub use io::{JobDescriptor, JobState, SlotValue, ToolInfo};
pub use template::Invocation;
pub use tool::{ResourceHints, Tool, ToolInput, ToolOutput};
