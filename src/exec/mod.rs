//! Running a single action as an external process.

pub mod output;
pub mod process;

pub use output::{split_lines, LineSplitter};
pub use process::{ActionRunner, ExecutionResult, ProcessExecutor};
