//! Parameter signature introspection
//!
//! [`TensorInfo`] describes one tensor parameter (data type + shape).
//! [`ArgInfo`] is the ordered signature of a program's entry function, read
//! straight from the buffer metadata the program declares.
//!
//! Text form: `TensorInfo("float32", [1, 224, 224, 3])`
//! Wire form: `["TENSOR", "float32", [1, 224, 224, 3]]`

use crate::errors::{IrError, Result};
use crate::program::{IRModule, PrimFunc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::ops::Index;

/// Wire tag of a tensor descriptor
pub const TENSOR_TAG: &str = "TENSOR";

/// Data type + shape of one tensor parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    dtype: String,
    shape: Vec<u64>,
}

impl TensorInfo {
    /// Any dtype name is accepted; every extent must be non-negative.
    pub fn new(dtype: impl Into<String>, shape: impl IntoIterator<Item = i64>) -> Result<Self> {
        let dtype = dtype.into();
        let shape = shape
            .into_iter()
            .enumerate()
            .map(|(axis, extent)| {
                u64::try_from(extent).map_err(|_| {
                    IrError::format(format!(
                        "TensorInfo(\"{}\"): extent {} on axis {} is negative",
                        dtype, extent, axis
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dtype, shape })
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Canonical text form
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Canonical wire form: `["TENSOR", dtype, shape]`
    pub fn as_json(&self) -> Value {
        Value::Array(vec![
            Value::from(TENSOR_TAG),
            Value::from(self.dtype.as_str()),
            Value::Array(self.shape.iter().map(|&d| Value::from(d)).collect()),
        ])
    }

    /// Parse the wire form
    pub fn from_json(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| IrError::format(format!("expected a JSON array, got {}", value)))?;
        let [tag, dtype, shape] = items.as_slice() else {
            return Err(IrError::format(format!(
                "expected 3 elements [\"{}\", dtype, shape], got {}",
                TENSOR_TAG,
                items.len()
            )));
        };

        if tag.as_str() != Some(TENSOR_TAG) {
            return Err(IrError::format(format!(
                "expected tag \"{}\", got {}",
                TENSOR_TAG, tag
            )));
        }
        let dtype = dtype
            .as_str()
            .ok_or_else(|| IrError::format(format!("dtype must be a string, got {}", dtype)))?;
        let extents = shape
            .as_array()
            .ok_or_else(|| IrError::format(format!("shape must be an array, got {}", shape)))?;

        let mut dims = Vec::with_capacity(extents.len());
        for extent in extents {
            let dim = extent.as_u64().ok_or_else(|| {
                IrError::format(format!(
                    "shape entries must be non-negative integers, got {}",
                    extent
                ))
            })?;
            dims.push(dim);
        }

        Ok(Self {
            dtype: dtype.to_string(),
            shape: dims,
        })
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorInfo(\"{}\", [", self.dtype)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "])")
    }
}

impl Serialize for TensorInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (TENSOR_TAG, &self.dtype, &self.shape).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TensorInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        TensorInfo::from_json(&value).map_err(D::Error::custom)
    }
}

/// Ordered parameter signature of a program's entry function
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgInfo {
    args: Vec<TensorInfo>,
}

impl ArgInfo {
    pub fn new(args: Vec<TensorInfo>) -> Self {
        Self { args }
    }

    /// Introspect a program: resolve its entry function, then read its signature
    pub fn from_entry_func(module: &IRModule) -> Result<Self> {
        let (_, func) = module.entry_func()?;
        Self::from_prim_func(func)
    }

    /// Read the declared buffer of every formal parameter, in order
    pub fn from_prim_func(func: &PrimFunc) -> Result<Self> {
        let args = func
            .params
            .iter()
            .map(|param| {
                let buffer = func.param_buffer(param).ok_or_else(|| {
                    IrError::lookup(format!(
                        "parameter '{}' has no buffer bound in the function's buffer map",
                        param
                    ))
                })?;
                TensorInfo::new(buffer.dtype.clone(), buffer.shape.iter().copied())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { args })
    }

    pub fn as_json(&self) -> Value {
        Value::Array(self.args.iter().map(TensorInfo::as_json).collect())
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let items = value.as_array().ok_or_else(|| {
            IrError::format(format!("expected a JSON array of tensors, got {}", value))
        })?;
        let args = items
            .iter()
            .map(TensorInfo::from_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { args })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorInfo> {
        self.args.iter()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn as_slice(&self) -> &[TensorInfo] {
        &self.args
    }

    pub fn into_vec(self) -> Vec<TensorInfo> {
        self.args
    }
}

impl Index<usize> for ArgInfo {
    type Output = TensorInfo;

    fn index(&self, index: usize) -> &TensorInfo {
        &self.args[index]
    }
}

impl IntoIterator for ArgInfo {
    type Item = TensorInfo;
    type IntoIter = std::vec::IntoIter<TensorInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.into_iter()
    }
}

impl<'a> IntoIterator for &'a ArgInfo {
    type Item = &'a TensorInfo;
    type IntoIter = std::slice::Iter<'a, TensorInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.iter()
    }
}
