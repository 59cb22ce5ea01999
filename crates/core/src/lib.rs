// crates/core/src/lib.rs
pub mod config;
pub mod ffmpeg;
pub mod filename;
pub mod process;
pub mod separator;
pub mod transform;

pub use config::*;
pub use filename::*;
pub use process::{ProcessError, Progress, ProgressSink};
pub use transform::*;
