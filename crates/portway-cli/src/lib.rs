//! Library surface of the `portway` binary: daemon runtime and IPC protocol

pub mod daemon;
pub mod ipc;
