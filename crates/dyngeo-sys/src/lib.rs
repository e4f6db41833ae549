//! Headless driver for the acceleration-structure scheduler.

pub mod cmdline;
pub mod demo;

pub use cmdline::{CmdlineError, CommandLine};
pub use demo::{run, DemoError, RunSummary};
