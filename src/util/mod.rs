//! Small helpers for the command line entry point.

pub mod lock;
