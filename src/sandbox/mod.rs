//! Sandboxed script execution.
//!
//! The work is split between the host process and one worker process per
//! request:
//!
//! | Side | Module | Role |
//! |------|--------|------|
//! | Host | [`engine`] | Validation, admission, worker lifecycle, deadlines |
//! | Worker | [`worker`] | Protocol endpoint, resource limits |
//! | Worker | [`realm`] | Fresh engine context with a pruned global object |
//! | Worker | [`collector`] | Ordered, capped console output |
//! | Both | [`outcome`] | Classified end state of an execution |
//! | Both | [`allowlist`] | Globals a script may reach |

pub mod allowlist;
pub mod collector;
pub mod engine;
pub mod outcome;
pub mod realm;
pub mod worker;
