//! CLI command implementations for the `drover` binary.

pub mod ctl;
pub mod run;
pub mod worker;
