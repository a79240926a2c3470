//! Converts MapReduce application names to actual application code.
//!
//! # Example
//!
//! To get the inverted index application:
//! ```
//! # use anyhow::Result;
//! use mrinvert::workload;
//! # fn main() -> Result<()> {
//! let invert = workload::named("invert")?;
//! # Ok(())
//! # }
//! ```

use crate::{JobError, Workload};
use anyhow::Result;

pub mod invert;

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "invert" | "index-inverter" => Some(Workload {
            args_fn: invert::prepare_args,
            map_fn: invert::map,
            reduce_fn: invert::reduce,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns a [`JobError::UnknownWorkload`] if no application with the given
/// name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => Err(JobError::UnknownWorkload(name.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names() {
        assert!(try_named("invert").is_some());
        assert!(try_named("index-inverter").is_some());
        assert!(named("invert").is_ok());
    }

    #[test]
    fn unknown_name_is_a_job_error() {
        assert!(try_named("wc").is_none());
        let err = named("wc").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::UnknownWorkload(name)) if name == "wc"
        ));
    }
}
