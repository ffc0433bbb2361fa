//! Library half of the settings loader, shared with the benchmarks

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod args;
pub mod arx;
pub mod common;
pub mod control;
pub mod fanout;
pub mod load;
pub mod monitoring;
pub mod runlog;
pub mod settings;
