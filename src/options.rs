//! Per-function configuration and generic option values.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Default value of an input that nothing was written to.
pub const DEFAULT_ZERO: f64 = 0.0;
/// Default for inputs meaning "unbounded above".
pub const DEFAULT_INF: f64 = f64::INFINITY;
/// Default for inputs meaning "unbounded below".
pub const DEFAULT_MINF: f64 = f64::NEG_INFINITY;

/// Dynamically typed option or statistics value.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GenericType {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringVector(Vec<String>),
}

impl GenericType {
    pub fn type_name(&self) -> &'static str {
        match self {
            GenericType::Bool(_) => "bool",
            GenericType::Int(_) => "int",
            GenericType::Float(_) => "float",
            GenericType::String(_) => "string",
            GenericType::StringVector(_) => "string vector",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            GenericType::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            GenericType::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Floats, and ints widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            GenericType::Float(v) => Some(v),
            GenericType::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GenericType::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_vector(&self) -> Option<&[String]> {
        match self {
            GenericType::StringVector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for GenericType {
    fn from(v: bool) -> Self {
        GenericType::Bool(v)
    }
}

impl From<i64> for GenericType {
    fn from(v: i64) -> Self {
        GenericType::Int(v)
    }
}

impl From<i32> for GenericType {
    fn from(v: i32) -> Self {
        GenericType::Int(v as i64)
    }
}

impl From<usize> for GenericType {
    fn from(v: usize) -> Self {
        GenericType::Int(v as i64)
    }
}

impl From<f64> for GenericType {
    fn from(v: f64) -> Self {
        GenericType::Float(v)
    }
}

impl From<&str> for GenericType {
    fn from(v: &str) -> Self {
        GenericType::String(v.to_string())
    }
}

impl From<String> for GenericType {
    fn from(v: String) -> Self {
        GenericType::String(v)
    }
}

impl From<Vec<String>> for GenericType {
    fn from(v: Vec<String>) -> Self {
        GenericType::StringVector(v)
    }
}

impl From<Vec<&str>> for GenericType {
    fn from(v: Vec<&str>) -> Self {
        GenericType::StringVector(v.into_iter().map(str::to_string).collect())
    }
}

/// String-keyed dictionary of generic values.
pub type Dict = BTreeMap<String, GenericType>;

/// Options of one function.
///
/// Everything may be set before `init()`; afterwards only the diagnostic
/// flags ([`FunctionOptions::DIAGNOSTIC`]) can change.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct FunctionOptions {
    /// Log lifecycle and cache events to stderr.
    pub verbose: bool,
    /// Names of monitored events: `"inputs"`, `"outputs"`, `"eval"`.
    pub monitor: Vec<String>,
    /// Fail evaluation when an output is not finite.
    pub regularity_check: bool,
    /// Fail evaluation when an input is not finite.
    pub inputs_check: bool,
    /// Record evaluation counts and timings.
    pub gather_stats: bool,
    /// Weight of forward mode in the derivative mode choice, in `[0, 1]`.
    /// 0 forces forward, 1 forces reverse.
    pub ad_weight: f64,
    /// Same as `ad_weight`, for sparsity propagation.
    pub ad_weight_sp: f64,
    /// Maximum number of directions per derivative sweep.
    pub max_num_dir: usize,
    /// Directional derivatives are taken as Jacobian-times-seed products
    /// once the direction count exceeds `jac_penalty` times the nonzeros
    /// seeded per direction. Negative disables the switch.
    pub jac_penalty: f64,
    /// Compile the generated code of the function at init.
    pub jit: bool,
    /// Registered compiler plugin used when `jit` is set.
    pub compiler: String,
    /// Options forwarded to the compiler plugin.
    pub jit_options: Dict,
    /// `"name:description"` entries for the inputs.
    pub input_scheme: Vec<String>,
    /// `"name:description"` entries for the outputs.
    pub output_scheme: Vec<String>,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        FunctionOptions {
            verbose: false,
            monitor: Vec::new(),
            regularity_check: false,
            inputs_check: false,
            gather_stats: false,
            ad_weight: 0.5,
            ad_weight_sp: 0.5,
            max_num_dir: 64,
            jac_penalty: 2.0,
            jit: false,
            compiler: "clang".to_string(),
            jit_options: Dict::new(),
            input_scheme: Vec::new(),
            output_scheme: Vec::new(),
        }
    }
}

impl FunctionOptions {
    /// Every option name accepted by [`set`](Self::set).
    pub const NAMES: [&'static str; 14] = [
        "verbose",
        "monitor",
        "regularity_check",
        "inputs_check",
        "gather_stats",
        "ad_weight",
        "ad_weight_sp",
        "max_num_dir",
        "jac_penalty",
        "jit",
        "compiler",
        "jit_options",
        "input_scheme",
        "output_scheme",
    ];

    /// Options that stay mutable after `init()`.
    pub const DIAGNOSTIC: [&'static str; 5] = [
        "verbose",
        "monitor",
        "regularity_check",
        "inputs_check",
        "gather_stats",
    ];

    /// Set an option by name.
    ///
    /// `jit_options` is set from a string-vector of `key=value` entries.
    pub fn set(&mut self, name: &str, value: GenericType) -> Result<()> {
        let mismatch = |expected: &str, value: &GenericType| {
            Error::invalid(
                "FunctionOptions",
                format!(
                    "option '{name}' expects {expected}, got {}",
                    value.type_name()
                ),
            )
        };
        match name {
            "verbose" | "regularity_check" | "inputs_check" | "gather_stats" | "jit" => {
                let b = value.as_bool().ok_or_else(|| mismatch("bool", &value))?;
                match name {
                    "verbose" => self.verbose = b,
                    "regularity_check" => self.regularity_check = b,
                    "inputs_check" => self.inputs_check = b,
                    "gather_stats" => self.gather_stats = b,
                    _ => self.jit = b,
                }
            }
            "ad_weight" | "ad_weight_sp" => {
                let w = value.as_float().ok_or_else(|| mismatch("float", &value))?;
                if !(0.0..=1.0).contains(&w) {
                    return Err(Error::invalid(
                        "FunctionOptions",
                        format!("option '{name}' must lie in [0, 1], got {w}"),
                    ));
                }
                if name == "ad_weight" {
                    self.ad_weight = w;
                } else {
                    self.ad_weight_sp = w;
                }
            }
            "jac_penalty" => {
                let p = value.as_float().ok_or_else(|| mismatch("float", &value))?;
                if (0.0..1.0).contains(&p) {
                    return Err(Error::invalid(
                        "FunctionOptions",
                        format!("option 'jac_penalty' must be negative or at least 1, got {p}"),
                    ));
                }
                self.jac_penalty = p;
            }
            "max_num_dir" => {
                let n = value.as_int().ok_or_else(|| mismatch("int", &value))?;
                if n < 1 {
                    return Err(Error::invalid(
                        "FunctionOptions",
                        format!("option 'max_num_dir' must be positive, got {n}"),
                    ));
                }
                self.max_num_dir = n as usize;
            }
            "compiler" => {
                let s = value.as_str().ok_or_else(|| mismatch("string", &value))?;
                self.compiler = s.to_string();
            }
            "monitor" | "input_scheme" | "output_scheme" => {
                let v = value
                    .as_string_vector()
                    .ok_or_else(|| mismatch("string vector", &value))?
                    .to_vec();
                match name {
                    "monitor" => self.monitor = v,
                    "input_scheme" => self.input_scheme = v,
                    _ => self.output_scheme = v,
                }
            }
            "jit_options" => {
                let entries = value
                    .as_string_vector()
                    .ok_or_else(|| mismatch("string vector", &value))?;
                let mut dict = Dict::new();
                for entry in entries {
                    let (key, val) = entry.split_once('=').ok_or_else(|| {
                        Error::invalid(
                            "FunctionOptions",
                            format!("jit option '{entry}' is not of the form key=value"),
                        )
                    })?;
                    dict.insert(key.to_string(), GenericType::String(val.to_string()));
                }
                self.jit_options = dict;
            }
            _ => {
                return Err(Error::not_found(
                    "FunctionOptions",
                    name,
                    Self::NAMES.iter().map(|s| s.to_string()).collect(),
                ))
            }
        }
        Ok(())
    }

    /// Read an option back by name.
    pub fn get(&self, name: &str) -> Result<GenericType> {
        Ok(match name {
            "verbose" => self.verbose.into(),
            "monitor" => self.monitor.clone().into(),
            "regularity_check" => self.regularity_check.into(),
            "inputs_check" => self.inputs_check.into(),
            "gather_stats" => self.gather_stats.into(),
            "ad_weight" => self.ad_weight.into(),
            "ad_weight_sp" => self.ad_weight_sp.into(),
            "max_num_dir" => self.max_num_dir.into(),
            "jac_penalty" => self.jac_penalty.into(),
            "jit" => self.jit.into(),
            "compiler" => self.compiler.clone().into(),
            "jit_options" => GenericType::StringVector(
                self.jit_options
                    .iter()
                    .map(|(k, v)| match v {
                        GenericType::String(s) => format!("{k}={s}"),
                        other => format!("{k}={other:?}"),
                    })
                    .collect(),
            ),
            "input_scheme" => self.input_scheme.clone().into(),
            "output_scheme" => self.output_scheme.clone().into(),
            _ => {
                return Err(Error::not_found(
                    "FunctionOptions",
                    name,
                    Self::NAMES.iter().map(|s| s.to_string()).collect(),
                ))
            }
        })
    }

    /// True when `name` is listed in `monitor`.
    pub fn is_monitored(&self, name: &str) -> bool {
        self.monitor.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let mut opts = FunctionOptions::default();
        opts.set("ad_weight", 0.0.into()).unwrap();
        opts.set("max_num_dir", 8.into()).unwrap();
        opts.set("input_scheme", vec!["x:state", "p"].into()).unwrap();
        assert_eq!(opts.get("ad_weight").unwrap(), GenericType::Float(0.0));
        assert_eq!(opts.max_num_dir, 8);
        assert_eq!(opts.input_scheme, vec!["x:state".to_string(), "p".to_string()]);
    }

    #[test]
    fn unknown_option_lists_alternatives() {
        let mut opts = FunctionOptions::default();
        let err = opts.set("verbsoe", true.into()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("verbsoe"));
        assert!(msg.contains("verbose"));
    }

    #[test]
    fn wrong_type_and_range_rejected() {
        let mut opts = FunctionOptions::default();
        assert!(opts.set("verbose", 1.into()).is_err());
        assert!(opts.set("ad_weight", 1.5.into()).is_err());
        assert!(opts.set("max_num_dir", 0.into()).is_err());
        assert!(opts.set("jac_penalty", 0.5.into()).is_err());
        assert!(opts.set("jac_penalty", (-1.0).into()).is_ok());
    }

    #[test]
    fn verbosity_and_monitors_are_options() {
        let mut opts = FunctionOptions::default();
        assert!(!opts.verbose);
        opts.set("verbose", true.into()).unwrap();
        opts.set("monitor", vec!["eval"].into()).unwrap();
        assert!(opts.verbose);
        assert!(opts.is_monitored("eval"));
        assert!(!opts.is_monitored("sp_fwd"));
        assert_eq!(opts.get("verbose").unwrap(), GenericType::Bool(true));
    }
}
