#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod agent;
pub mod backend;
pub mod cache;
pub mod config;
pub mod copy;
pub mod crash;
pub mod error;
pub mod exec;
pub mod key;
pub mod layer;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod util;
pub mod verify;

pub use cache::Invalidate;
pub use error::SnapError;
pub use layer::{BuildContext, CreateOptions, LayerBuilder, StartOptions};
