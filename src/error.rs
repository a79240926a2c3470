//! Configuration errors for a job.
//!
//! These are fatal and reported before any output is produced. Everything
//! else (I/O, spill failures) travels as a plain [`anyhow::Error`]; callers
//! can tell the two apart with `err.downcast_ref::<JobError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("No input found at `{0}`")]
    NoInput(String),

    #[error("Invalid input pattern `{pattern}`: {source}")]
    InputPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Output location must not be empty")]
    EmptyOutput,

    #[error("Output location `{0}` would overwrite the input")]
    OutputContainsInput(PathBuf),

    #[error("Number of reducers must be at least 1")]
    ZeroReducers,

    #[error("No app named `{0}` found.")]
    UnknownWorkload(String),

    #[error("Invalid arguments for `{workload}`: {message}")]
    WorkloadArgs { workload: String, message: String },
}
