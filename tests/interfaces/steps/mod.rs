//! Cucumber step definitions for interface tests.

pub mod history;
pub mod hyperdeck;
pub mod queue;
pub mod runner;
