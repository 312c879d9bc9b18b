//! Parameter store
//!
//! Scripts read named parameters through UI controls. The first read of a
//! name registers it with its default; later passes read the overrides the
//! host supplies with each evaluation. Parameters not read during a
//! successful pass are dropped so the panel always matches the script.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::Number(_) => "number",
            ParamValue::Text(_) => "text",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// UI control that registered a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Control {
    Slider {
        min: f64,
        max: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Checkbox,
    TextInput,
    Dropdown {
        options: Vec<String>,
    },
    Button,
}

impl Control {
    fn same_kind(&self, other: &Control) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// One registered parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub value: ParamValue,
    pub control: Control,
}

/// Parameter declaration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("Slider '{name}' has an invalid range [{min}, {max}]")]
    InvalidRange { name: String, min: f64, max: f64 },
    #[error("Slider '{name}' has an invalid step {step}")]
    InvalidStep { name: String, step: f64 },
    #[error("Dropdown '{0}' has no options")]
    EmptyOptions(String),
    #[error("Dropdown '{name}' default '{default}' is not one of its options")]
    InvalidDefault { name: String, default: String },
    #[error("Parameter name must not be empty")]
    EmptyName,
}

/// Parameter store owned by the execution context
#[derive(Debug, Default)]
pub struct ParameterStore {
    entries: BTreeMap<String, ParameterEntry>,
    overrides: BTreeMap<String, ParamValue>,
    touched: BTreeSet<String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass with the overrides supplied by the host
    pub fn begin_pass(&mut self, overrides: BTreeMap<String, ParamValue>) {
        self.overrides = overrides;
        self.touched.clear();
    }

    /// Finish a pass; a successful pass forgets parameters it did not read
    pub fn end_pass(&mut self, success: bool) {
        if success {
            let touched = &self.touched;
            self.entries.retain(|name, _| touched.contains(name));
        }
        self.overrides.clear();
    }

    /// Snapshot for `getParameters`
    pub fn snapshot(&self) -> BTreeMap<String, ParameterEntry> {
        self.entries.clone()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidate value: a host override, else the value kept from earlier passes
    fn candidate(&self, name: &str, control: &Control) -> Option<ParamValue> {
        if let Some(value) = self.overrides.get(name) {
            return Some(value.clone());
        }
        self.entries
            .get(name)
            .filter(|entry| entry.control.same_kind(control))
            .map(|entry| entry.value.clone())
    }

    fn register(&mut self, name: &str, value: ParamValue, control: Control) -> ParamValue {
        self.touched.insert(name.to_string());
        self.entries.insert(
            name.to_string(),
            ParameterEntry {
                value: value.clone(),
                control,
            },
        );
        value
    }

    fn check_name(name: &str) -> Result<(), ParamError> {
        if name.trim().is_empty() {
            Err(ParamError::EmptyName)
        } else {
            Ok(())
        }
    }

    fn mismatch(name: &str, expected: &str, value: &ParamValue) {
        warn!(
            "Ignoring override for '{}': expected {}, got {}",
            name,
            expected,
            value.type_name()
        );
    }

    /// Numeric slider, clamped into `[min, max]`
    pub fn slider(
        &mut self,
        name: &str,
        default: f64,
        min: f64,
        max: f64,
        step: Option<f64>,
    ) -> Result<f64, ParamError> {
        Self::check_name(name)?;
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(ParamError::InvalidRange {
                name: name.into(),
                min,
                max,
            });
        }
        if let Some(step) = step {
            if !(step.is_finite() && step > 0.0) {
                return Err(ParamError::InvalidStep {
                    name: name.into(),
                    step,
                });
            }
        }

        let control = Control::Slider { min, max, step };
        let value = match self.candidate(name, &control) {
            Some(ParamValue::Number(n)) if n.is_finite() => n,
            Some(other) => {
                Self::mismatch(name, "number", &other);
                default
            }
            None => default,
        };
        let value = if value.is_finite() { value } else { min };
        let value = value.clamp(min, max);
        self.register(name, ParamValue::Number(value), control);
        Ok(value)
    }

    pub fn checkbox(&mut self, name: &str, default: bool) -> Result<bool, ParamError> {
        Self::check_name(name)?;
        let control = Control::Checkbox;
        let value = match self.candidate(name, &control) {
            Some(ParamValue::Bool(b)) => b,
            Some(other) => {
                Self::mismatch(name, "boolean", &other);
                default
            }
            None => default,
        };
        self.register(name, ParamValue::Bool(value), control);
        Ok(value)
    }

    pub fn text_input(&mut self, name: &str, default: &str) -> Result<String, ParamError> {
        Self::check_name(name)?;
        let control = Control::TextInput;
        let value = match self.candidate(name, &control) {
            Some(ParamValue::Text(s)) => s,
            Some(other) => {
                Self::mismatch(name, "text", &other);
                default.to_string()
            }
            None => default.to_string(),
        };
        self.register(name, ParamValue::Text(value.clone()), control);
        Ok(value)
    }

    /// Choice from a fixed list; unknown values fall back to the default
    pub fn dropdown(
        &mut self,
        name: &str,
        default: &str,
        options: Vec<String>,
    ) -> Result<String, ParamError> {
        Self::check_name(name)?;
        if options.is_empty() {
            return Err(ParamError::EmptyOptions(name.into()));
        }
        if !options.iter().any(|o| o == default) {
            return Err(ParamError::InvalidDefault {
                name: name.into(),
                default: default.into(),
            });
        }

        let control = Control::Dropdown { options };
        let value = match self.candidate(name, &control) {
            Some(ParamValue::Text(s)) => s,
            Some(other) => {
                Self::mismatch(name, "text", &other);
                default.to_string()
            }
            None => default.to_string(),
        };
        let value = match &control {
            Control::Dropdown { options } if options.contains(&value) => value,
            _ => {
                warn!("Dropdown '{}' has no option '{}', using default", name, value);
                default.to_string()
            }
        };
        self.register(name, ParamValue::Text(value.clone()), control);
        Ok(value)
    }

    /// Momentary button; pressed only for the pass whose overrides say so
    pub fn button(&mut self, name: &str) -> Result<bool, ParamError> {
        Self::check_name(name)?;
        let pressed = match self.overrides.get(name) {
            Some(ParamValue::Bool(b)) => *b,
            Some(other) => {
                Self::mismatch(name, "boolean", other);
                false
            }
            None => false,
        };
        self.register(name, ParamValue::Bool(pressed), Control::Button);
        Ok(pressed)
    }
}
