//! Supervisor for the Alchitry `loader` tool.
//!
//! Runs device listing, EEPROM flashing, programming and erasing as
//! background jobs, one at a time, relaying the tool's output as a status
//! line and reporting each job's outcome over an event channel.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
