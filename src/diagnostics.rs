//! Statistics recorded by the engine.

use crate::options::{Dict, GenericType};

/// Statistics dictionary of one function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    stats: Dict,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to an integer counter, creating it at zero.
    pub fn increment(&mut self, name: &str) {
        let entry = self
            .stats
            .entry(name.to_string())
            .or_insert(GenericType::Int(0));
        if let GenericType::Int(n) = entry {
            *n += 1;
        } else {
            *entry = GenericType::Int(1);
        }
    }

    /// Add `value` to a floating accumulator, creating it at zero.
    pub fn accumulate(&mut self, name: &str, value: f64) {
        let entry = self
            .stats
            .entry(name.to_string())
            .or_insert(GenericType::Float(0.0));
        let current = entry.as_float().unwrap_or(0.0);
        *entry = GenericType::Float(current + value);
    }

    pub fn get(&self, name: &str) -> Option<&GenericType> {
        self.stats.get(name)
    }

    pub fn stats(&self) -> &Dict {
        &self.stats
    }
}
