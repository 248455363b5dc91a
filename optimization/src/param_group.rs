use std::collections::BTreeMap;

use crate::{
    error::{Error, Result},
    parameter::Parameter,
};

/// A set of parameters sharing the same scalar hyperparameters.
///
/// Options are kept in a `BTreeMap` so iteration is always in key order.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    params: Vec<Parameter>,
    options: BTreeMap<String, f64>,
}

impl ParamGroup {
    /// Creates a new `ParamGroup` without options.
    ///
    /// # Arguments
    /// * `params` - The parameters belonging to this group.
    pub fn new(params: Vec<Parameter>) -> Self {
        Self {
            params,
            options: BTreeMap::new(),
        }
    }

    /// Builder: sets an option on the group.
    pub fn with_option(mut self, key: impl Into<String>, value: f64) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Builder: sets `key` only if the group doesn't already define it.
    pub fn with_default(mut self, key: impl Into<String>, value: f64) -> Self {
        self.options.entry(key.into()).or_insert(value);
        self
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Scalar options in key order.
    pub fn options(&self) -> &BTreeMap<String, f64> {
        &self.options
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.options.get(key).copied()
    }

    /// Returns the option `key`.
    ///
    /// # Errors
    /// Returns `Error::MissingOption` if the group doesn't define it.
    pub fn require(&self, key: &str) -> Result<f64> {
        self.get(key).ok_or_else(|| Error::MissingOption {
            key: key.to_string(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.options.insert(key.into(), value);
    }

    /// Total amount of scalars across the group's parameters.
    pub fn numel(&self) -> usize {
        self.params.iter().map(Parameter::len).sum()
    }
}
