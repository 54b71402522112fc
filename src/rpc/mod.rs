//! RPC surface: framed wire protocol and the worker-side client

pub mod client;
pub mod wire;

pub use client::PserverClient;
pub use wire::{Request, Response};
