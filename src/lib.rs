#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod config;
mod core;
mod error;
pub mod executor;
mod graph;
mod lazy;
mod param;
mod utils;

pub use crate::builder::{Delayed, Fragments, wrap};
pub use crate::config::{ComputeConfig, ENV_ON_FAILURE, ENV_WORKERS, FailurePolicy};
pub use crate::core::Dynamic;
pub use crate::error::*;
pub use crate::executor::{Diagnostics, TaskExecution, TaskState, compute};
pub use crate::graph::{Arg, Call, CallFn, Input, Literal, Task, TaskGraph, TaskKey};
pub use crate::lazy::{Lazy, Operator};
pub use crate::param::{Lit, MaybeLazy, Opaque, Param};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
