#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod cli;
