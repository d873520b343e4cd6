//! Scriptbox - sandboxed execution of untrusted JavaScript snippets
//!
//! Each request runs in a fresh realm inside its own short-lived worker
//! process. The realm exposes only an allowlist of pure language builtins
//! plus a captured `console` and realm-scoped timers. Console output is
//! collected and returned together with the program's return value or its
//! error, and a wall-clock deadline is enforced by killing the worker.

pub mod api;
pub mod config;
pub mod error;
pub mod result;
pub mod sandbox;
pub mod utils;
