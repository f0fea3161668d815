//! Capability policy: the single description of what a snippet may touch.
//!
//! A policy is loaded once at startup, checked, and then shared read-only by
//! every execution. The sandbox never consults anything else to decide which
//! host facilities are reachable.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CodeletError, Result};

/// Policy format understood by this build.
pub const POLICY_VERSION: u32 = 1;

/// Smallest V8 heap the isolate can boot in without aborting the process.
pub const MIN_HEAP_MB: usize = 16;

/// Largest heap ceiling a policy may ask for.
pub const MAX_HEAP_MB: usize = 16 * 1024;

/// Longest wall-clock budget a policy may ask for (one hour).
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// A host facility that a snippet could reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// `setTimeout` and friends
    Timers,
    /// Outbound HTTP through `fetch`
    Network,
    /// Engine internals and anything that could signal or block the host thread
    ProcessControl,
    /// Walking `.constructor` chains up to the function constructors
    ConstructorReflection,
    /// Host filesystem (never bound, listed so policies state it explicitly)
    Filesystem,
    /// `eval` and the `Function` constructor
    CodeGeneration,
    /// `require`, `importScripts`
    ModuleLoading,
    /// The `WebAssembly` namespace
    #[serde(rename = "webassembly")]
    WebAssembly,
}

impl Capability {
    /// Capabilities a consistent policy must always deny.
    pub const MANDATORY_DENIALS: [Capability; 6] = [
        Capability::ProcessControl,
        Capability::Timers,
        Capability::CodeGeneration,
        Capability::ModuleLoading,
        Capability::ConstructorReflection,
        Capability::Filesystem,
    ];

    /// Globals removed from the sandbox realm when this capability is denied.
    pub fn globals(&self) -> &'static [&'static str] {
        match self {
            Capability::Timers => &[
                "setTimeout",
                "setInterval",
                "setImmediate",
                "clearTimeout",
                "clearInterval",
                "clearImmediate",
            ],
            Capability::Network => &["fetch", "WebSocket", "XMLHttpRequest", "EventSource"],
            Capability::ProcessControl => &[
                "Deno",
                "process",
                "__bootstrap",
                "Atomics",
                "SharedArrayBuffer",
            ],
            Capability::CodeGeneration => &["eval", "Function"],
            Capability::ModuleLoading => &["require", "importScripts"],
            Capability::WebAssembly => &["WebAssembly"],
            Capability::ConstructorReflection | Capability::Filesystem => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Timers => "timers",
            Capability::Network => "network",
            Capability::ProcessControl => "process-control",
            Capability::ConstructorReflection => "constructor-reflection",
            Capability::Filesystem => "filesystem",
            Capability::CodeGeneration => "code-generation",
            Capability::ModuleLoading => "module-loading",
            Capability::WebAssembly => "webassembly",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permitted operations and resource ceilings for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    /// Policy format version
    pub version: u32,
    /// Maximum snippet length in characters, measured after trimming
    pub max_code_length: usize,
    /// Wall-clock budget per execution in milliseconds
    pub timeout_ms: u64,
    /// V8 heap ceiling in megabytes
    pub max_heap_mb: usize,
    /// Ceiling on captured output (and on fetched response bodies) in bytes
    pub max_output_bytes: usize,
    /// Capabilities the snippet may not reach
    pub denied: BTreeSet<Capability>,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        let mut denied: BTreeSet<Capability> = Capability::MANDATORY_DENIALS.into_iter().collect();
        denied.insert(Capability::Network);
        denied.insert(Capability::WebAssembly);

        Self {
            version: POLICY_VERSION,
            max_code_length: 10_000,
            timeout_ms: 5_000,
            max_heap_mb: 64,
            max_output_bytes: 1024 * 1024,
            denied,
        }
    }
}

impl CapabilityPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grants(&self, capability: Capability) -> bool {
        !self.denied.contains(&capability)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_code_length(mut self, max_code_length: usize) -> Self {
        self.max_code_length = max_code_length;
        self
    }

    pub fn grant(mut self, capability: Capability) -> Self {
        self.denied.remove(&capability);
        self
    }

    /// Verify the policy can be enforced. An inconsistent policy must never be
    /// used to build a sandbox.
    pub fn check(&self) -> Result<()> {
        if self.version != POLICY_VERSION {
            return Err(CodeletError::Policy(format!(
                "unsupported policy version {} (expected {})",
                self.version, POLICY_VERSION
            )));
        }
        if self.max_code_length == 0 {
            return Err(CodeletError::Policy(
                "max_code_length must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(CodeletError::Policy(format!(
                "timeout_ms must be between 1 and {} (got {})",
                MAX_TIMEOUT_MS, self.timeout_ms
            )));
        }
        if self.max_output_bytes == 0 {
            return Err(CodeletError::Policy(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if !(MIN_HEAP_MB..=MAX_HEAP_MB).contains(&self.max_heap_mb) {
            return Err(CodeletError::Policy(format!(
                "max_heap_mb must be between {} and {} (got {})",
                MIN_HEAP_MB, MAX_HEAP_MB, self.max_heap_mb
            )));
        }
        let missing: Vec<&str> = Capability::MANDATORY_DENIALS
            .iter()
            .filter(|c| !self.denied.contains(*c))
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CodeletError::Policy(format!(
                "capabilities that must be denied are granted: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// The binding handed to the sandbox bootstrap script.
    pub fn binding(&self) -> SandboxBinding {
        let mut strip: Vec<&'static str> = self
            .denied
            .iter()
            .flat_map(|c| c.globals().iter().copied())
            .collect();
        strip.sort_unstable();
        strip.dedup();

        SandboxBinding {
            strip,
            lock_constructors: !self.grants(Capability::ConstructorReflection),
            network: self.grants(Capability::Network),
        }
    }
}

/// What the bootstrap script installs and removes inside a fresh realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxBinding {
    /// Globals deleted after the bootstrap has captured what it needs
    pub strip: Vec<&'static str>,
    /// Replace `constructor` on the function prototypes with `undefined`
    pub lock_constructors: bool,
    /// Install the `fetch` accessor
    pub network: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_consistent() {
        let policy = CapabilityPolicy::default();
        assert!(policy.check().is_ok());
        assert!(!policy.grants(Capability::Network));
        assert!(!policy.grants(Capability::WebAssembly));
        assert_eq!(policy.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_granting_mandatory_capability_is_inconsistent() {
        let policy = CapabilityPolicy::default().grant(Capability::Timers);
        let err = policy.check().unwrap_err();
        assert!(err.to_string().contains("timers"));
    }

    #[test]
    fn test_zero_ceilings_are_rejected() {
        let policy = CapabilityPolicy::default().with_timeout(Duration::ZERO);
        assert!(policy.check().is_err());

        let policy = CapabilityPolicy::default().with_max_code_length(0);
        assert!(policy.check().is_err());

        let policy = CapabilityPolicy {
            max_heap_mb: 4,
            ..Default::default()
        };
        assert!(policy.check().is_err());
    }

    #[test]
    fn test_oversized_ceilings_are_rejected() {
        let policy = CapabilityPolicy {
            timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert!(policy.check().is_err());

        let policy = CapabilityPolicy::default().with_timeout(Duration::from_millis(MAX_TIMEOUT_MS));
        assert!(policy.check().is_ok());

        let policy = CapabilityPolicy {
            max_heap_mb: usize::MAX,
            ..Default::default()
        };
        assert!(policy.check().is_err());

        let policy = CapabilityPolicy {
            max_heap_mb: MAX_HEAP_MB,
            ..Default::default()
        };
        assert!(policy.check().is_ok());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let policy = CapabilityPolicy {
            version: 2,
            ..Default::default()
        };
        assert!(policy.check().unwrap_err().to_string().contains("version"));
    }

    #[test]
    fn test_binding_strips_denied_globals() {
        let binding = CapabilityPolicy::default().binding();
        for name in ["eval", "Function", "setTimeout", "Deno", "fetch", "WebAssembly"] {
            assert!(binding.strip.contains(&name), "{name} should be stripped");
        }
        assert!(binding.lock_constructors);
        assert!(!binding.network);
    }

    #[test]
    fn test_granting_network_installs_fetch() {
        let binding = CapabilityPolicy::default()
            .grant(Capability::Network)
            .binding();
        assert!(binding.network);
        assert!(!binding.strip.contains(&"fetch"));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: CapabilityPolicy = toml::from_str(
            r#"
            timeout_ms = 2000
            denied = ["timers", "process-control", "code-generation",
                      "module-loading", "constructor-reflection", "filesystem"]
            "#,
        )
        .unwrap();
        assert_eq!(policy.timeout(), Duration::from_secs(2));
        assert!(policy.grants(Capability::Network));
        assert!(policy.grants(Capability::WebAssembly));
        assert!(policy.check().is_ok());
    }
}
