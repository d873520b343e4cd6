//! Shared utility modules for scriptbox.
//!
//! This module provides small helpers used across the sandbox
//! implementation, currently UTF-8-safe text handling.

pub mod text;
