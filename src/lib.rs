#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod analytics;
pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod observer;
pub mod paths;
pub mod provision;
pub mod util;

#[cfg(test)]
mod testing;
