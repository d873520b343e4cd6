//! Sandbox realm construction and in-realm execution.
//!
//! A [`SandboxRealm`] is a fresh boa [`Context`] whose global object has been
//! pruned down to the [global allowlist](crate::sandbox::allowlist) and then
//! given a `console` bound to a private [`OutputCollector`] plus realm-scoped
//! timers. Realms are built per request, used once and dropped; nothing in
//! them refers back to host state other than the collector they own.
//!
//! # Lifecycle
//!
//! 1. [`RealmBuilder::build`] creates the context and runs the prelude
//! 2. [`SandboxRealm::compile`] parses the user's program (not billed against
//!    the deadline)
//! 3. [`SandboxRealm::execute`] evaluates it, drains promise jobs and pending
//!    timers, and classifies the result
//! 4. [`SandboxRealm::finish`] seals the collector and tears the realm down
//!
//! The realm itself has no notion of a deadline. It always runs inside a
//! worker process that the host kills when the deadline passes; see
//! [`crate::sandbox::engine`].
//!
//! # Example
//!
//! ```no_run
//! use scriptbox::sandbox::realm::{RealmBuilder, RealmLimits};
//!
//! # fn example() -> anyhow::Result<()> {
//! let mut realm = RealmBuilder::new(RealmLimits::default()).build()?;
//! let outcome = match realm.compile("console.log('hi'); 6 * 7") {
//!     Ok(script) => realm.execute(&script),
//!     Err(outcome) => outcome,
//! };
//! let output = realm.finish();
//! assert_eq!(output.lines, vec!["hi"]);
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use boa_engine::builtins::promise::{OperationType, PromiseState};
use boa_engine::context::HostHooks;
use boa_engine::object::builtins::{JsArray, JsPromise};
use boa_engine::object::{FunctionObjectBuilder, JsObject};
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    js_string, Context, JsArgs, JsData, JsError, JsString, JsValue, NativeFunction, Script,
    Source,
};
use boa_gc::{Finalize, Trace};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::sandbox::allowlist::engine_global_names;
use crate::sandbox::collector::{CollectedOutput, OutputCollector, Severity};
use crate::sandbox::outcome::ExecutionOutcome;
use crate::utils::text::truncate_on_char_boundary;

const PRELUDE: &str = include_str!("prelude.js");

/// Rendering used when a value cannot be turned into text at all.
pub const UNSERIALIZABLE: &str = "[Unserializable]";

/// Deepest bracket nesting accepted before parsing.
pub const MAX_NESTING_DEPTH: usize = 1000;

/// Promises rejected with no handler attached, in rejection order.
#[derive(Default, Trace, Finalize, JsData)]
struct UnhandledRejections {
    promises: Vec<JsObject>,
}

/// Host hooks shared by every realm. State lives in each realm's
/// host-defined slot.
struct SandboxHooks;

impl HostHooks for SandboxHooks {
    fn promise_rejection_tracker(
        &self,
        promise: &JsObject,
        operation: OperationType,
        context: &mut Context,
    ) {
        let realm = context.realm().clone();
        let mut host = realm.host_defined_mut();
        let Some(tracked) = host.get_mut::<UnhandledRejections>() else {
            return;
        };
        match operation {
            OperationType::Reject => tracked.promises.push(promise.clone()),
            OperationType::Handle => tracked
                .promises
                .retain(|pending| !JsObject::equals(pending, promise)),
        }
    }
}

static SANDBOX_HOOKS: SandboxHooks = SandboxHooks;

/// Per-realm resource bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RealmLimits {
    /// Cap on buffered diagnostic output, in bytes.
    pub max_output_bytes: usize,
    /// Maximum JavaScript call depth before a `RuntimeLimit` error is raised.
    pub recursion_limit: usize,
}

impl Default for RealmLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            recursion_limit: 400,
        }
    }
}

/// Builds one fresh realm per request.
#[derive(Debug, Clone)]
pub struct RealmBuilder {
    limits: RealmLimits,
}

impl RealmBuilder {
    pub fn new(limits: RealmLimits) -> Self {
        Self { limits }
    }

    /// Creates a new isolated realm.
    ///
    /// # Errors
    ///
    /// Fails only on host-side problems: the engine could not allocate a
    /// context, or the prelude could not prune the global object. Callers
    /// report these as `InternalFailure`.
    pub fn build(&self) -> Result<SandboxRealm> {
        let mut context = Context::builder()
            .host_hooks(&SANDBOX_HOOKS)
            .build()
            .map_err(|e| anyhow!("Failed to create JavaScript context: {}", e))?;

        let mut runtime_limits = RuntimeLimits::default();
        runtime_limits.set_recursion_limit(self.limits.recursion_limit);
        context.set_runtime_limits(runtime_limits);
        context
            .realm()
            .host_defined_mut()
            .insert_default::<UnhandledRejections>();

        let collector = Rc::new(RefCell::new(OutputCollector::new(
            self.limits.max_output_bytes,
        )));

        let sink = Rc::clone(&collector);
        // SAFETY: the closure captures only an `Rc<RefCell<OutputCollector>>`,
        // which owns no garbage-collected values and never needs tracing.
        let record = unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let code = args.get_or_undefined(0).to_i32(ctx)?;
                let text = args.get_or_undefined(1).to_string(ctx)?;
                if let Some(severity) = Severity::from_code(code) {
                    sink.borrow_mut()
                        .record(severity, &text.to_std_string_escaped());
                }
                Ok(JsValue::undefined())
            })
        };
        let record = FunctionObjectBuilder::new(context.realm(), record)
            .name(js_string!("record"))
            .length(2)
            .build();

        let allowed = JsArray::from_iter(
            engine_global_names().map(|name| JsValue::from(JsString::from(name))),
            &mut context,
        );

        let setup = context
            .eval(Source::from_bytes(PRELUDE))
            .map_err(|e| anyhow!("Failed to evaluate realm prelude: {}", e))?;
        let setup = setup
            .as_callable()
            .cloned()
            .ok_or_else(|| anyhow!("Realm prelude did not produce a setup function"))?;

        let hooks = setup
            .call(
                &JsValue::undefined(),
                &[JsValue::from(record), JsValue::from(allowed)],
                &mut context,
            )
            .map_err(|e| anyhow!("Failed to initialise realm globals: {}", e))?;
        let hooks = PreludeHooks::from_value(&hooks, &mut context)?;

        tracing::debug!("Built sandbox realm");

        Ok(SandboxRealm {
            context,
            collector,
            hooks,
            limits: self.limits,
        })
    }
}

/// Functions returned by the prelude that the host calls into.
struct PreludeHooks {
    render: JsObject,
    describe: JsObject,
    next_timer: JsObject,
    fire_timer: JsObject,
}

impl PreludeHooks {
    fn from_value(value: &JsValue, context: &mut Context) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("Realm prelude did not return its hooks"))?;

        let mut hook = |name: &str| -> Result<JsObject> {
            object
                .get(JsString::from(name), context)
                .map_err(|e| anyhow!("Failed to read prelude hook {}: {}", name, e))?
                .as_callable()
                .cloned()
                .ok_or_else(|| anyhow!("Prelude hook {} is not callable", name))
        };

        Ok(Self {
            render: hook("render")?,
            describe: hook("describe")?,
            next_timer: hook("nextTimer")?,
            fire_timer: hook("fireTimer")?,
        })
    }
}

/// A parsed program, ready to run in the realm that compiled it.
pub struct CompiledScript {
    script: Script,
}

/// One isolated execution environment.
///
/// Not `Send`: a realm lives and dies on the thread that built it.
pub struct SandboxRealm {
    context: Context,
    collector: Rc<RefCell<OutputCollector>>,
    hooks: PreludeHooks,
    limits: RealmLimits,
}

impl SandboxRealm {
    /// Parses `source` as a classic script.
    ///
    /// A syntax error is returned as a ready-made `Thrown` outcome with the
    /// compile class, never as a host error.
    pub fn compile(&mut self, source: &str) -> std::result::Result<CompiledScript, ExecutionOutcome> {
        let depth = bracket_depth(source);
        if depth > MAX_NESTING_DEPTH {
            return Err(ExecutionOutcome::compile_error(format!(
                "SyntaxError: program nesting too deep ({} levels, limit {})",
                depth, MAX_NESTING_DEPTH
            )));
        }

        match Script::parse(Source::from_bytes(source), None, &mut self.context) {
            Ok(script) => Ok(CompiledScript { script }),
            Err(err) => Err(ExecutionOutcome::compile_error(self.describe_error(&err))),
        }
    }

    /// Runs a compiled program to completion.
    ///
    /// The script body runs first and its completion value becomes the
    /// candidate return value. Promise jobs are then drained, followed by
    /// every pending timer in due order, sleeping until each one is due. An
    /// uncaught exception anywhere along the way ends execution with a
    /// runtime `Thrown` outcome.
    pub fn execute(&mut self, compiled: &CompiledScript) -> ExecutionOutcome {
        let value = match compiled.script.evaluate(&mut self.context) {
            Ok(value) => value,
            Err(err) => return ExecutionOutcome::runtime_error(self.describe_error(&err)),
        };

        let return_value = if value.is_undefined() {
            None
        } else {
            Some(self.render(&value))
        };

        if let Err(err) = self.drain_timers() {
            return ExecutionOutcome::runtime_error(self.describe_error(&err));
        }

        ExecutionOutcome::completed(return_value)
    }

    /// Convenience wrapper: compile then execute.
    pub fn run(&mut self, source: &str) -> ExecutionOutcome {
        match self.compile(source) {
            Ok(script) => self.execute(&script),
            Err(outcome) => outcome,
        }
    }

    /// Renders a value with the same rules `console.log` uses.
    pub fn render(&mut self, value: &JsValue) -> String {
        let rendered = self
            .hooks
            .render
            .call(&JsValue::undefined(), &[value.clone()], &mut self.context)
            .ok()
            .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
            .unwrap_or_else(|| UNSERIALIZABLE.to_string());

        truncate_on_char_boundary(&rendered, self.limits.max_output_bytes).to_string()
    }

    /// Seals the collector and drops the realm, timers included.
    pub fn finish(self) -> CollectedOutput {
        let output = self.collector.borrow_mut().finish();
        drop(self.hooks);
        drop(self.context);
        output
    }

    fn drain_timers(&mut self) -> std::result::Result<(), JsError> {
        loop {
            self.context.run_jobs();
            if let Some(reason) = self.take_unhandled_rejection() {
                return Err(JsError::from_opaque(reason));
            }

            let wait = self
                .hooks
                .next_timer
                .call(&JsValue::undefined(), &[], &mut self.context)?
                .to_number(&mut self.context)?;
            if wait.is_nan() || wait < 0.0 {
                return Ok(());
            }
            if wait > 0.0 {
                std::thread::sleep(Duration::from_millis(wait.ceil() as u64));
            }

            self.hooks
                .fire_timer
                .call(&JsValue::undefined(), &[], &mut self.context)?;
        }
    }

    /// Oldest promise rejection that still has no handler.
    fn take_unhandled_rejection(&mut self) -> Option<JsValue> {
        let promise = {
            let realm = self.context.realm().clone();
            let mut host = realm.host_defined_mut();
            let tracked = host.get_mut::<UnhandledRejections>()?;
            if tracked.promises.is_empty() {
                return None;
            }
            tracked.promises.remove(0)
        };

        match JsPromise::from_object(promise).ok()?.state() {
            PromiseState::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// One-line description of an uncaught error.
    ///
    /// Engine errors (syntax errors, runtime limits) use their native
    /// `Kind: message` form; values thrown by the program go through the
    /// prelude's `describe`, which formats `Error` objects as `name: message`
    /// and renders anything else like `console.log` would.
    fn describe_error(&mut self, err: &JsError) -> String {
        let described = match err.as_native() {
            Some(native) => native.to_string(),
            None => {
                let thrown = err.as_opaque().cloned().unwrap_or_else(JsValue::undefined);
                self.hooks
                    .describe
                    .call(&JsValue::undefined(), &[thrown], &mut self.context)
                    .ok()
                    .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
                    .unwrap_or_else(|| UNSERIALIZABLE.to_string())
            }
        };

        truncate_on_char_boundary(&described, self.limits.max_output_bytes).to_string()
    }
}

/// Deepest `(`, `[` or `{` nesting outside string literals and comments.
fn bracket_depth(source: &str) -> usize {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            quote @ (b'"' | b'\'' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    deepest
}
