//! Global variables with override frames.
//!
//! Overrides applied when a scan starts are pushed as one frame; stopping or
//! stashing the scan pops the frame and puts the previous values back. Frames
//! nest, so a resumed scan can push its overrides on top of whatever is active.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Previous values of the names one frame touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Frame {
    saved: BTreeMap<String, Option<f64>>,
}

/// Global variable dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariables {
    values: BTreeMap<String, f64>,
    #[serde(skip)]
    frames: Vec<Frame>,
}

/// Globals shared between the controller and readers.
pub type SharedGlobals = Arc<RwLock<GlobalVariables>>;

impl GlobalVariables {
    /// Dictionary from initial values.
    pub fn from_values(values: BTreeMap<String, f64>) -> Self {
        Self {
            values,
            frames: Vec::new(),
        }
    }

    /// Wrap for sharing.
    pub fn into_shared(self) -> SharedGlobals {
        Arc::new(RwLock::new(self))
    }

    /// Current value.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Set a value outside any frame.
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// All current values.
    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    /// Apply `overrides` as a new frame.
    pub fn push_overrides(&mut self, overrides: &BTreeMap<String, f64>) {
        let mut frame = Frame::default();
        for (name, value) in overrides {
            let previous = self.values.insert(name.clone(), *value);
            frame.saved.entry(name.clone()).or_insert(previous);
        }
        self.frames.push(frame);
    }

    /// Undo the newest frame. Returns `false` if there was none.
    pub fn pop_overrides(&mut self) -> bool {
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        for (name, previous) in frame.saved {
            match previous {
                Some(value) => self.values.insert(name, value),
                None => self.values.remove(&name),
            };
        }
        true
    }

    /// Number of active frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_restore_previous_values() {
        let mut globals = GlobalVariables::default();
        globals.set("detuning", 1.0);
        globals.push_overrides(&BTreeMap::from([
            ("detuning".to_string(), 5.0),
            ("cycles".to_string(), 3.0),
        ]));
        assert_eq!(globals.get("detuning"), Some(5.0));
        globals.push_overrides(&BTreeMap::from([("detuning".to_string(), 7.0)]));
        assert_eq!(globals.depth(), 2);

        assert!(globals.pop_overrides());
        assert_eq!(globals.get("detuning"), Some(5.0));
        assert!(globals.pop_overrides());
        assert_eq!(globals.get("detuning"), Some(1.0));
        assert_eq!(globals.get("cycles"), None);
        assert!(!globals.pop_overrides());
    }
}
