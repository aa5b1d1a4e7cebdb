pub mod cli;
pub mod exec;
pub mod js;
pub mod stats;

pub use exec::{ExecError, LocalScheduler};
pub use js::ScriptRunner;
