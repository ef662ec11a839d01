//! External scan parameters.
//!
//! An external scan moves an instrument knob (a DAC voltage, a synthesizer
//! frequency, a motion stage) between points. Anything that can be set and
//! reports when it has settled implements [`ScanParameter`].
//!
//! # Contract
//! - `set_value()` only starts the change; it returns before the value settled
//! - `is_settled()` is polled by the scan controller at its settle period
//! - `value()` returns the current (possibly moving) value
//!
//! Implementations use interior mutability; all methods take `&self`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

/// A host-stepped scan parameter.
#[async_trait]
pub trait ScanParameter: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Current value.
    async fn value(&self) -> Result<f64>;

    /// Start moving to `value`.
    async fn set_value(&self, value: f64) -> Result<()>;

    /// Whether the last requested value has been reached.
    async fn is_settled(&self) -> Result<bool>;

    /// How long a change may take; the engine default when `None`.
    fn settle_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Scan parameters by name.
#[derive(Default, Clone)]
pub struct ParameterRegistry {
    parameters: HashMap<String, Arc<dyn ScanParameter>>,
}

impl ParameterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under its own name, replacing an older one.
    pub fn register(&mut self, parameter: Arc<dyn ScanParameter>) {
        self.parameters.insert(parameter.name().to_string(), parameter);
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScanParameter>> {
        self.parameters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parameters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("parameters", &self.names())
            .finish()
    }
}

#[derive(Debug)]
struct SimState {
    value: f64,
    settles_at: Instant,
    visits: Vec<f64>,
}

/// Parameter that settles after a fixed delay and records every value it was
/// asked to take.
#[derive(Debug)]
pub struct SimulatedParameter {
    name: String,
    settle_time: Duration,
    timeout: Option<Duration>,
    stuck: AtomicBool,
    fail_next_set: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedParameter {
    /// Parameter at `initial` that needs `settle_time` per change.
    pub fn new(name: impl Into<String>, initial: f64, settle_time: Duration) -> Self {
        Self {
            name: name.into(),
            settle_time,
            timeout: None,
            stuck: AtomicBool::new(false),
            fail_next_set: AtomicBool::new(false),
            state: Mutex::new(SimState {
                value: initial,
                settles_at: Instant::now(),
                visits: Vec::new(),
            }),
        }
    }

    /// Set the parameter's own settle timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Never report settled while `stuck` is set.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::Release);
    }

    /// Make the next `set_value` fail.
    pub fn fail_next_set(&self) {
        self.fail_next_set.store(true, Ordering::Release);
    }

    /// Values requested so far, in order.
    pub fn visits(&self) -> Vec<f64> {
        self.state.lock().visits.clone()
    }
}

#[async_trait]
impl ScanParameter for SimulatedParameter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn value(&self) -> Result<f64> {
        Ok(self.state.lock().value)
    }

    async fn set_value(&self, value: f64) -> Result<()> {
        if self.fail_next_set.swap(false, Ordering::AcqRel) {
            bail!("{} refused value {value}", self.name);
        }
        let mut state = self.state.lock();
        state.value = value;
        state.settles_at = Instant::now() + self.settle_time;
        state.visits.push(value);
        Ok(())
    }

    async fn is_settled(&self) -> Result<bool> {
        if self.stuck.load(Ordering::Acquire) {
            return Ok(false);
        }
        Ok(Instant::now() >= self.state.lock().settles_at)
    }

    fn settle_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
