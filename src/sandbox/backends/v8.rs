//! V8 isolate backend.
//!
//! Every execution gets a fresh `JsRuntime` on its own OS thread, driven by a
//! current-thread tokio runtime. A watchdog thread holds the isolate's
//! thread-safe handle and terminates execution at the deadline, which stops
//! non-yielding loops as well as pending async work.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::output::OutputBuffer;
use crate::sandbox::ops::{codelet_ext, FinalRejection, NetworkGate};
use crate::sandbox::policy::{Capability, CapabilityPolicy};
use crate::sandbox::traits::{BackendCapabilities, SandboxBackend};
use crate::sandbox::ExecutionOutcome;
use crate::validate::ValidatedCode;

const BOOTSTRAP: &str = include_str!("bootstrap.js");
const BOOTSTRAP_NAME: &str = "[codelet:bootstrap]";
const SNIPPET_NAME: &str = "[codelet:snippet]";

const SANDBOX_STACK_SIZE: usize = 8 * 1024 * 1024;
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Runs snippets in throwaway V8 isolates.
pub struct V8Backend {
    policy: Arc<CapabilityPolicy>,
}

impl V8Backend {
    pub fn new(policy: Arc<CapabilityPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl SandboxBackend for V8Backend {
    fn name(&self) -> &str {
        "v8"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            networking: self.policy.grants(Capability::Network),
            preemptive: true,
        }
    }

    async fn execute(&self, code: ValidatedCode) -> ExecutionOutcome {
        let started = Instant::now();

        if let Err(e) = self.policy.check() {
            warn!(error = %e, "Refusing to build sandbox from inconsistent policy");
            return ExecutionOutcome::SetupFailed {
                message: e.to_string(),
            };
        }

        debug!(
            code_chars = code.as_str().chars().count(),
            timeout_ms = self.policy.timeout_ms,
            "Starting sandbox thread"
        );

        let policy = Arc::clone(&self.policy);
        let (tx, rx) = oneshot::channel();

        let spawned = thread::Builder::new()
            .name("codelet-sandbox".to_string())
            .stack_size(SANDBOX_STACK_SIZE)
            .spawn(move || {
                let outcome = run_isolated(&policy, code.as_str());
                if tx.send(outcome).is_err() {
                    warn!("Sandbox outcome receiver dropped");
                }
            });

        let outcome = match spawned {
            Ok(_) => rx.await.unwrap_or_else(|_| ExecutionOutcome::SetupFailed {
                message: "sandbox worker exited before reporting an outcome".to_string(),
            }),
            Err(e) => ExecutionOutcome::SetupFailed {
                message: format!("failed to spawn sandbox thread: {}", e),
            },
        };

        info!(
            outcome = outcome.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snippet finished"
        );
        outcome
    }
}

fn run_isolated(policy: &CapabilityPolicy, code: &str) -> ExecutionOutcome {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            return ExecutionOutcome::SetupFailed {
                message: format!("failed to build sandbox runtime: {}", e),
            }
        }
    };
    rt.block_on(run_snippet(policy, code))
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState in `run_snippet`, which
    // removes this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + HEAP_GRACE_BYTES
}

/// Who settled the execution first: the snippet finishing or the deadline.
/// Exactly one side wins.
#[derive(Debug, Default)]
struct Settlement(AtomicU8);

impl Settlement {
    const RUNNING: u8 = 0;
    const COMPLETED: u8 = 1;
    const EXPIRED: u8 = 2;

    /// Claim the execution for the deadline. False if it already completed.
    fn expire(&self) -> bool {
        self.settle(Self::EXPIRED) == Self::EXPIRED
    }

    /// Claim the execution for the snippet. False if the deadline got there
    /// first.
    fn complete(&self) -> bool {
        self.settle(Self::COMPLETED) == Self::COMPLETED
    }

    fn settle(&self, to: u8) -> u8 {
        match self
            .0
            .compare_exchange(Self::RUNNING, to, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => to,
            Err(current) => current,
        }
    }
}

/// Terminates the isolate once the deadline passes unless stopped first.
struct Watchdog {
    handle: v8::IsolateHandle,
    settlement: Arc<Settlement>,
    cancel: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
    deadline: Instant,
}

impl Watchdog {
    fn start(handle: v8::IsolateHandle, timeout: Duration) -> std::io::Result<Self> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "timeout out of range")
        })?;
        let settlement = Arc::new(Settlement::default());
        let (cancel, cancelled) = mpsc::channel::<()>();

        let thread_handle = handle.clone();
        let thread_settlement = Arc::clone(&settlement);
        let thread = thread::Builder::new()
            .name("codelet-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    if thread_settlement.expire() {
                        thread_handle.terminate_execution();
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            "Deadline reached, terminating snippet"
                        );
                    }
                }
            })?;

        Ok(Self {
            handle,
            settlement,
            cancel,
            thread: Some(thread),
            deadline,
        })
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Expire early, used when pending async work outlives the deadline.
    fn fire(&self) {
        if self.settlement.expire() {
            self.handle.terminate_execution();
        }
    }

    /// Record completion, then stop and join the watchdog thread. Returns
    /// whether the deadline won.
    fn stop(mut self) -> bool {
        let timed_out = !self.settlement.complete();
        let _ = self.cancel.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        timed_out
    }
}

async fn run_snippet(policy: &CapabilityPolicy, code: &str) -> ExecutionOutcome {
    let network = if policy.grants(Capability::Network) {
        match NetworkGate::new(policy.timeout(), policy.max_output_bytes) {
            Ok(gate) => Some(gate),
            Err(e) => {
                return ExecutionOutcome::SetupFailed {
                    message: format!("failed to build HTTP client: {}", e),
                }
            }
        }
    } else {
        None
    };

    let mut runtime = match create_runtime(policy) {
        Ok(runtime) => runtime,
        Err(message) => return ExecutionOutcome::SetupFailed { message },
    };

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(OutputBuffer::new(policy.max_output_bytes));
        if let Some(gate) = network {
            state.put(gate);
        }
    }

    let finish = match bootstrap(&mut runtime, policy) {
        Ok(finish) => finish,
        Err(message) => return ExecutionOutcome::SetupFailed { message },
    };

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut c_void,
    );

    let watchdog = match Watchdog::start(runtime.v8_isolate().thread_safe_handle(), policy.timeout())
    {
        Ok(watchdog) => watchdog,
        Err(e) => {
            runtime
                .v8_isolate()
                .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
            return ExecutionOutcome::SetupFailed {
                message: format!("failed to spawn watchdog thread: {}", e),
            };
        }
    };

    let failure = run_to_completion(&mut runtime, code, &finish, &watchdog).await;

    let timed_out = watchdog.stop();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
    let heap_exceeded = heap_state.triggered.load(Ordering::SeqCst);

    let (output, rejection) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let output = state
            .try_take::<OutputBuffer>()
            .map(OutputBuffer::finish)
            .unwrap_or_default();
        (output, state.try_take::<FinalRejection>())
    };

    drop(finish);
    drop(runtime);
    drop(heap_state);

    if heap_exceeded {
        ExecutionOutcome::ThrownError {
            output,
            message: format!("Memory limit of {} MB exceeded", policy.max_heap_mb),
        }
    } else if timed_out {
        ExecutionOutcome::TimedOut {
            output,
            timeout: policy.timeout(),
        }
    } else if let Some(message) = failure {
        ExecutionOutcome::ThrownError { output, message }
    } else if let Some(FinalRejection(message)) = rejection {
        ExecutionOutcome::ThrownError { output, message }
    } else {
        ExecutionOutcome::Completed { output }
    }
}

fn create_runtime(policy: &CapabilityPolicy) -> Result<JsRuntime, String> {
    let max_heap = policy
        .max_heap_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| format!("heap ceiling of {} MB is out of range", policy.max_heap_mb))?;
    panic::catch_unwind(AssertUnwindSafe(|| {
        JsRuntime::new(RuntimeOptions {
            extensions: vec![codelet_ext::init_ops()],
            create_params: Some(v8::CreateParams::default().heap_limits(0, max_heap)),
            ..Default::default()
        })
    }))
    .map_err(|_| "failed to create V8 isolate".to_string())
}

/// Evaluate the bootstrap with the policy binding. Yields the completion
/// reporter the bootstrap evaluates to.
fn bootstrap(
    runtime: &mut JsRuntime,
    policy: &CapabilityPolicy,
) -> Result<v8::Global<v8::Value>, String> {
    let binding = serde_json::to_string(&policy.binding())
        .map_err(|e| format!("failed to encode sandbox binding: {}", e))?;
    let source = format!("({})(Deno.core.ops, {});", BOOTSTRAP.trim(), binding);
    runtime
        .execute_script(BOOTSTRAP_NAME, source)
        .map_err(|e| format!("sandbox bootstrap failed: {}", e))
}

/// Run the snippet, report its completion value and drive pending work until
/// the event loop is idle or the deadline passes. Returns the thrown message,
/// if any.
async fn run_to_completion(
    runtime: &mut JsRuntime,
    code: &str,
    finish: &v8::Global<v8::Value>,
    watchdog: &Watchdog,
) -> Option<String> {
    let completion = match runtime.execute_script(SNIPPET_NAME, code.to_string()) {
        Ok(value) => value,
        Err(e) => return Some(thrown_message(&e.to_string())),
    };

    if let Err(message) = report_completion(runtime, finish, completion) {
        return Some(message);
    }

    match tokio::time::timeout(
        watchdog.remaining(),
        runtime.run_event_loop(PollEventLoopOptions::default()),
    )
    .await
    {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(thrown_message(&e.to_string())),
        Err(_) => {
            watchdog.fire();
            None
        }
    }
}

fn report_completion(
    runtime: &mut JsRuntime,
    finish: &v8::Global<v8::Value>,
    completion: v8::Global<v8::Value>,
) -> Result<(), String> {
    let scope = &mut runtime.handle_scope();
    let finish = v8::Local::new(scope, finish);
    let finish = v8::Local::<v8::Function>::try_from(finish)
        .map_err(|_| "sandbox bootstrap did not yield a reporter".to_string())?;
    let value = v8::Local::new(scope, completion);
    let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

    let scope = &mut v8::TryCatch::new(scope);
    if finish.call(scope, receiver, &[value]).is_some() {
        return Ok(());
    }

    let message = match scope.exception() {
        Some(exception) => exception
            .to_string(scope)
            .map(|text| text.to_rust_string_lossy(scope)),
        None => None,
    };
    Err(message.unwrap_or_else(|| "execution terminated".to_string()))
}

/// First line of an engine error, without the "Uncaught" prefix.
fn thrown_message(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or_default().trim();
    let line = line
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| line.strip_prefix("Uncaught "))
        .unwrap_or(line);
    if line.is_empty() {
        "Unknown error".to_string()
    } else {
        line.to_string()
    }
}
