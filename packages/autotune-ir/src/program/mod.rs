//! Structured program representation
//!
//! Candidate programs are plain data so they can be shipped to isolated
//! worker processes and introspected without executing anything.

mod func;

pub use func::{Block, Buffer, FuncAttrs, IterKind, IterVar, PrimFunc};

use crate::errors::{IrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the conventional entry function
pub const ENTRY_NAME: &str = "main";

/// A collection of named primitive functions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRModule {
    functions: BTreeMap<String, PrimFunc>,
}

impl IRModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module holding a single function
    pub fn from_func(name: impl Into<String>, func: PrimFunc) -> Self {
        let mut module = Self::new();
        module.add_func(name, func);
        module
    }

    /// Insert (or replace) a function
    pub fn add_func(&mut self, name: impl Into<String>, func: PrimFunc) {
        self.functions.insert(name.into(), func);
    }

    pub fn get(&self, name: &str) -> Option<&PrimFunc> {
        self.functions.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PrimFunc)> {
        self.functions.iter().map(|(name, func)| (name.as_str(), func))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolve the designated entry function
    ///
    /// A single-function module's only function is its entry. Otherwise the
    /// function exported as `main` wins, then the function named `main`.
    pub fn entry_func(&self) -> Result<(&str, &PrimFunc)> {
        if self.functions.len() == 1 {
            if let Some((name, func)) = self.functions.iter().next() {
                return Ok((name.as_str(), func));
            }
        }

        self.functions
            .iter()
            .find(|(_, func)| func.global_symbol() == Some(ENTRY_NAME))
            .or_else(|| self.functions.get_key_value(ENTRY_NAME))
            .map(|(name, func)| (name.as_str(), func))
            .ok_or_else(|| {
                IrError::lookup(format!(
                    "no entry function in module with {} function(s): {:?}",
                    self.functions.len(),
                    self.functions.keys().collect::<Vec<_>>()
                ))
            })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
