//! Backend rotation management.
//!
//! The [`RotationManager`] owns an ordered, cyclic list of named
//! backends, lazily instantiates their clients via factories, applies
//! per-backend retry/backoff on usage-limit errors, and exposes a
//! specialized test-fix entry point that detects a backend stuck on a
//! repeated prompt.
//!
//! The manager is an explicitly constructed, dependency-injected
//! instance with process-wide lifetime owned by the top-level
//! application; there is no global or singleton state. All access is
//! strictly sequential, so backend selection is deterministic given the
//! sequence of calls and failures.
//!
//! # State machine (per backend, during one `invoke`)
//!
//! ```text
//! ATTEMPTING(retries_left) ──success──────────────> DONE
//!          │ usage-limit, retries_left > 0
//!          └──sleep──> ATTEMPTING(retries_left - 1)
//!          │ usage-limit, retries_left == 0
//!          └─────────> ROTATED (next backend's ATTEMPTING)
//!          │ timeout / other error
//!          └─────────> FAILED (terminal, propagates)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backend::state::RotationStateStore;
use crate::backend::{BackendClient, BackendSpec};
use crate::error::InvokeError;

/// Factory that builds a backend client on first use.
///
/// A factory failure is fatal to the call that triggered it: it is
/// never retried and never masked by rotation.
pub type ClientFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn BackendClient>> + Send + Sync>;

/// Consecutive identical-prompt executions on one backend before the
/// manager forces a rotation. Repeating the same prompt this many times
/// is a strong signal the backend is stuck producing no useful change.
const SAME_PROMPT_ROTATION_LIMIT: u32 = 2;

/// Manages an ordered, cyclic set of LLM backends.
pub struct RotationManager {
    /// Backends in rotation order; index 0 is the configured default.
    backends: Vec<BackendSpec>,
    /// Lazily built clients, at most one per backend name.
    clients: HashMap<String, Arc<dyn BackendClient>>,
    /// Factories for backends whose client has not been built yet.
    factories: HashMap<String, ClientFactory>,
    /// Cursor into `backends`; always a valid index.
    current_idx: usize,
    /// Prompt remembered by the test-fix entry point.
    last_prompt: Option<String>,
    /// Backend active when the remembered prompt last ran.
    last_backend: Option<String>,
    /// Consecutive identical-prompt executions on `last_backend`.
    same_prompt_count: u32,
    /// The next resolved client should be reset to its default model.
    pending_model_reset: bool,
    /// Optional durable record of the active backend.
    state_store: Option<RotationStateStore>,
}

impl RotationManager {
    /// Create a manager from a default backend, its pre-built client,
    /// the backend list, and factories for the remaining clients.
    ///
    /// The list is rotated once so the default backend occupies
    /// position 0; if the default is absent from the supplied order it
    /// is inserted at position 0 with default policy. Subsequent
    /// rotation is cyclic over this order.
    #[must_use]
    pub fn new(
        default_backend: &str,
        default_client: Arc<dyn BackendClient>,
        mut backends: Vec<BackendSpec>,
        factories: HashMap<String, ClientFactory>,
    ) -> Self {
        match backends.iter().position(|b| b.name == default_backend) {
            Some(pos) => backends.rotate_left(pos),
            None => backends.insert(0, BackendSpec::named(default_backend)),
        }

        let mut clients: HashMap<String, Arc<dyn BackendClient>> = HashMap::new();
        clients.insert(default_backend.to_string(), default_client);

        Self {
            backends,
            clients,
            factories,
            current_idx: 0,
            last_prompt: None,
            last_backend: None,
            same_prompt_count: 0,
            pending_model_reset: false,
            state_store: None,
        }
    }

    /// Attach a durable state store, written on every backend switch.
    #[must_use]
    pub fn with_state_store(mut self, store: RotationStateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Name of the currently active backend.
    #[must_use]
    pub fn active_backend(&self) -> &str {
        &self.backends[self.current_idx].name
    }

    /// Model name of the active backend's client, or the backend name
    /// if its client has not been built yet.
    #[must_use]
    pub fn active_model_name(&self) -> String {
        let name = self.active_backend();
        self.clients
            .get(name)
            .map_or_else(|| name.to_string(), |c| c.model_name().to_string())
    }

    /// Backend names in rotation order (default first).
    #[must_use]
    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    /// Advance the cursor to the next backend in cyclic order.
    ///
    /// Persists the new active backend (best effort) and schedules a
    /// default-model reset for the backend being landed on.
    pub fn rotate_to_next(&mut self, reason: &str) {
        let from = self.active_backend().to_string();
        self.current_idx = (self.current_idx + 1) % self.backends.len();
        self.pending_model_reset = true;
        info!(
            "rotating backend {} -> {} ({reason})",
            from,
            self.active_backend()
        );
        self.persist_active_backend();
    }

    /// Move the cursor back to the default backend.
    pub fn reset_to_default(&mut self) {
        if self.current_idx == 0 {
            return;
        }
        debug!(
            "resetting backend {} -> {}",
            self.active_backend(),
            self.backends[0].name
        );
        self.current_idx = 0;
        self.pending_model_reset = true;
        self.persist_active_backend();
    }

    /// Reset to the default backend when the persisted state says the
    /// last switch is older than `max_age_seconds`.
    ///
    /// Returns `true` when a reset happened. Missing or unreadable
    /// state means no reset.
    pub fn maybe_reset_stale(&mut self, max_age_seconds: f64) -> bool {
        let Some(store) = &self.state_store else {
            return false;
        };
        let Some(state) = store.load() else {
            return false;
        };

        let age = Utc::now().timestamp() as f64 - state.last_switch_timestamp;
        if age <= max_age_seconds {
            return false;
        }

        info!(
            "persisted backend selection '{}' is {age:.0}s old (limit {max_age_seconds:.0}s); \
             resetting to default",
            state.current_backend
        );
        self.reset_to_default();
        // Even if the cursor was already on the default, refresh the
        // timestamp so the next staleness check starts from now.
        self.persist_active_backend();
        true
    }

    /// Invoke the active backend with retry-then-rotate semantics.
    ///
    /// Tries up to one full cycle of distinct backends. Usage-limit
    /// errors consume the backend's retry credits (sleeping the
    /// configured wait between attempts) and then rotate; timeouts and
    /// all other errors propagate immediately; a client factory
    /// failure is fatal and is not masked by rotation. When every
    /// backend fails with a usage limit, the last such error is
    /// returned.
    ///
    /// A successful call on a backend with
    /// `always_switch_after_execution` still returns its result, but
    /// the cursor advances so the *next* call starts on the following
    /// backend.
    pub async fn invoke(&mut self, prompt: &str) -> Result<String, InvokeError> {
        let total = self.backends.len();
        let mut last_usage_limit: Option<InvokeError> = None;

        for _ in 0..total {
            let spec = self.backends[self.current_idx].clone();
            let client = self.resolve_client(&spec.name)?;

            if self.pending_model_reset {
                self.pending_model_reset = false;
                if let Err(e) = client.switch_to_default_model().await {
                    warn!("backend '{}' failed to switch to default model: {e}", spec.name);
                }
            }

            let mut retries_left = spec.usage_limit_retry_count;
            loop {
                match client.invoke(prompt).await {
                    Ok(text) => {
                        debug!(
                            "backend '{}' answered ({} chars)",
                            spec.name,
                            text.len()
                        );
                        if spec.always_switch_after_execution {
                            self.rotate_to_next("always-switch flag");
                        }
                        return Ok(text);
                    }
                    Err(InvokeError::UsageLimit { message }) => {
                        if retries_left > 0 {
                            retries_left -= 1;
                            warn!(
                                "backend '{}' hit a usage limit ({message}); retrying in {}s \
                                 ({retries_left} retries left)",
                                spec.name, spec.usage_limit_retry_wait_seconds
                            );
                            tokio::time::sleep(Duration::from_secs_f64(
                                spec.usage_limit_retry_wait_seconds.max(0.0),
                            ))
                            .await;
                            continue;
                        }
                        warn!(
                            "backend '{}' exhausted usage-limit retries ({message})",
                            spec.name
                        );
                        last_usage_limit = Some(InvokeError::UsageLimit { message });
                        self.rotate_to_next("usage limit");
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        Err(last_usage_limit.unwrap_or_else(|| {
            InvokeError::usage_limit("all backends exhausted their usage limits")
        }))
    }

    /// Specialized entry point for test-fix prompts.
    ///
    /// Tracks the last prompt and the backend that served it. A changed
    /// prompt resets the cursor to the default backend; the third
    /// consecutive identical-prompt execution on the same backend
    /// forces a rotation first, breaking loops where a backend keeps
    /// producing no useful change without ever erroring. An identical
    /// prompt after an out-of-band backend switch just restarts the
    /// count.
    ///
    /// Delegates to [`invoke`](Self::invoke) and inherits its
    /// quota-retry/rotation behavior; the remembered prompt and backend
    /// are updated regardless of outcome.
    pub async fn run_test_fix_prompt(&mut self, prompt: &str) -> Result<String, InvokeError> {
        let same_prompt = self.last_prompt.as_deref() == Some(prompt);

        if same_prompt {
            let active = self.active_backend().to_string();
            if self.last_backend.as_deref() == Some(active.as_str()) {
                if self.same_prompt_count >= SAME_PROMPT_ROTATION_LIMIT {
                    info!(
                        "prompt repeated {} times on backend '{active}'; forcing rotation",
                        self.same_prompt_count + 1
                    );
                    self.rotate_to_next("repeated prompt");
                    self.same_prompt_count = 0;
                } else {
                    self.same_prompt_count += 1;
                }
            } else {
                // Out-of-band switch already landed somewhere new.
                self.same_prompt_count = 1;
            }
        } else {
            self.reset_to_default();
            self.same_prompt_count = 1;
        }

        let result = self.invoke(prompt).await;

        self.last_prompt = Some(prompt.to_string());
        self.last_backend = Some(self.active_backend().to_string());

        result
    }

    /// Close every instantiated client, once each.
    pub async fn close_all(&mut self) {
        for (name, client) in self.clients.drain() {
            debug!("closing backend client '{name}'");
            client.close().await;
        }
    }

    fn resolve_client(&mut self, name: &str) -> Result<Arc<dyn BackendClient>, InvokeError> {
        if let Some(client) = self.clients.get(name) {
            return Ok(client.clone());
        }

        let factory = self.factories.get(name).ok_or_else(|| {
            InvokeError::Other(anyhow!("no client factory registered for backend '{name}'"))
        })?;

        let client = factory().map_err(|e| {
            InvokeError::Other(e.context(format!("backend '{name}' client construction failed")))
        })?;

        debug!("instantiated client for backend '{name}'");
        self.clients.insert(name.to_string(), client.clone());
        Ok(client)
    }

    fn persist_active_backend(&self) {
        if let Some(store) = &self.state_store {
            let now = Utc::now().timestamp() as f64;
            store.save(self.active_backend(), now);
        }
    }
}
