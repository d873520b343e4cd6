//! The global allowlist: the only capabilities a sandboxed script can reach.
//!
//! The allowlist is plain data. A realm starts from a stock ECMAScript global
//! object and every own property whose name is not listed here is deleted
//! before any user code runs. The host then installs [`HOST_BINDINGS`]
//! (`console` and the realm-scoped timers) on top.
//!
//! Nothing that reaches outside the worker process is ever listed: there is no
//! `require`, `import`, `process`, `fetch`, `eval` or `Function`, and the
//! engine itself ships no filesystem, socket or environment bindings.
//!
//! | Category | Names |
//! |----------|-------|
//! | Math | `Math` |
//! | JSON | `JSON` |
//! | Date/time | `Date` |
//! | Regular expressions | `RegExp` |
//! | Primitives | `String`, `Number`, `Boolean`, `Symbol`, `parseInt`, ... |
//! | Collections | `Array`, `Object`, `Map`, `Set` |
//! | URI | `encodeURIComponent`, `decodeURIComponent`, `encodeURI`, `decodeURI` |
//! | Async | `Promise` |
//! | Errors | `Error`, `TypeError`, `RangeError`, ... |

use serde::Serialize;

/// Grouping used for documentation and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    Math,
    Json,
    DateTime,
    RegExp,
    Primitive,
    Collection,
    Uri,
    Async,
    Error,
    Core,
}

/// One global binding a realm is allowed to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub name: &'static str,
    pub category: CapabilityCategory,
}

const fn cap(name: &'static str, category: CapabilityCategory) -> Capability {
    Capability { name, category }
}

/// Engine-provided globals that survive realm pruning.
pub static GLOBAL_ALLOWLIST: &[Capability] = &[
    cap("globalThis", CapabilityCategory::Core),
    cap("undefined", CapabilityCategory::Core),
    cap("NaN", CapabilityCategory::Core),
    cap("Infinity", CapabilityCategory::Core),
    cap("Math", CapabilityCategory::Math),
    cap("JSON", CapabilityCategory::Json),
    cap("Date", CapabilityCategory::DateTime),
    cap("RegExp", CapabilityCategory::RegExp),
    cap("String", CapabilityCategory::Primitive),
    cap("Number", CapabilityCategory::Primitive),
    cap("Boolean", CapabilityCategory::Primitive),
    cap("Symbol", CapabilityCategory::Primitive),
    cap("parseInt", CapabilityCategory::Primitive),
    cap("parseFloat", CapabilityCategory::Primitive),
    cap("isNaN", CapabilityCategory::Primitive),
    cap("isFinite", CapabilityCategory::Primitive),
    cap("Array", CapabilityCategory::Collection),
    cap("Object", CapabilityCategory::Collection),
    cap("Map", CapabilityCategory::Collection),
    cap("Set", CapabilityCategory::Collection),
    cap("encodeURIComponent", CapabilityCategory::Uri),
    cap("decodeURIComponent", CapabilityCategory::Uri),
    cap("encodeURI", CapabilityCategory::Uri),
    cap("decodeURI", CapabilityCategory::Uri),
    cap("Promise", CapabilityCategory::Async),
    cap("Error", CapabilityCategory::Error),
    cap("TypeError", CapabilityCategory::Error),
    cap("RangeError", CapabilityCategory::Error),
    cap("SyntaxError", CapabilityCategory::Error),
    cap("ReferenceError", CapabilityCategory::Error),
    cap("EvalError", CapabilityCategory::Error),
    cap("URIError", CapabilityCategory::Error),
];

/// Globals the realm builder installs itself after pruning.
///
/// `console` is bound to the realm's output collector; the timer functions
/// schedule callbacks on the realm's own timer table, which dies with it.
pub static HOST_BINDINGS: &[&str] = &[
    "console",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
];

/// Returns `true` if `name` may exist on a realm's global object.
pub fn is_allowed(name: &str) -> bool {
    GLOBAL_ALLOWLIST.iter().any(|c| c.name == name) || HOST_BINDINGS.contains(&name)
}

/// Names of the allowlisted engine globals, in declaration order.
pub fn engine_global_names() -> impl Iterator<Item = &'static str> {
    GLOBAL_ALLOWLIST.iter().map(|c| c.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allowlist_has_no_duplicates() {
        let names: HashSet<&str> = GLOBAL_ALLOWLIST.iter().map(|c| c.name).collect();
        assert_eq!(names.len(), GLOBAL_ALLOWLIST.len());
    }

    #[test]
    fn test_allowlist_excludes_outside_world() {
        for name in [
            "process", "require", "module", "import", "fetch", "XMLHttpRequest", "WebSocket",
            "Deno", "Bun", "eval", "Function", "Reflect", "Proxy", "Atomics",
            "SharedArrayBuffer", "WeakRef",
        ] {
            assert!(!is_allowed(name), "{} must not be allowlisted", name);
        }
    }

    #[test]
    fn test_allowlist_covers_required_capabilities() {
        for name in [
            "Math", "JSON", "Date", "RegExp", "String", "Number", "Boolean",
            "encodeURIComponent", "decodeURIComponent", "Error",
        ] {
            assert!(is_allowed(name), "{} should be allowlisted", name);
        }
    }

    #[test]
    fn test_host_bindings_include_timers_and_console() {
        assert!(is_allowed("console"));
        assert!(is_allowed("setTimeout"));
        assert!(is_allowed("clearTimeout"));
    }

    #[test]
    fn test_host_bindings_disjoint_from_engine_globals() {
        for host in HOST_BINDINGS {
            assert!(GLOBAL_ALLOWLIST.iter().all(|c| c.name != *host));
        }
    }

    #[test]
    fn test_engine_global_names_order() {
        let names: Vec<&str> = engine_global_names().collect();
        assert_eq!(names.len(), GLOBAL_ALLOWLIST.len());
        assert_eq!(names[0], "globalThis");
        assert!(!names.contains(&"console"));
    }
}
