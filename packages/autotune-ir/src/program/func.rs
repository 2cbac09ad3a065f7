use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared storage for a tensor
///
/// `shape` is kept exactly as the program author wrote it. Validation
/// (non-negative extents) happens when the buffer is introspected or lowered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<i64>,
}

impl Buffer {
    pub fn new(
        name: impl Into<String>,
        dtype: impl Into<String>,
        shape: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.into(),
            shape: shape.into_iter().collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// Iteration variable kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterKind {
    Spatial,
    Reduce,
}

/// Block iteration variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterVar {
    pub name: String,
    pub extent: u64,
    pub kind: IterKind,
}

impl IterVar {
    pub fn spatial(name: impl Into<String>, extent: u64) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: IterKind::Spatial,
        }
    }

    pub fn reduce(name: impl Into<String>, extent: u64) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: IterKind::Reduce,
        }
    }
}

/// A computation block: an iteration domain plus the buffers it touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub iter_vars: Vec<IterVar>,
    /// Buffer names read by the block
    #[serde(default)]
    pub reads: Vec<String>,
    /// Buffer names written by the block
    #[serde(default)]
    pub writes: Vec<String>,
    /// Block carries an init statement (reduction)
    #[serde(default)]
    pub init: bool,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iter_vars: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            init: false,
        }
    }

    pub fn with_iter(mut self, iter_var: IterVar) -> Self {
        self.iter_vars.push(iter_var);
        self
    }

    pub fn reads(mut self, buffer: impl Into<String>) -> Self {
        self.reads.push(buffer.into());
        self
    }

    pub fn writes(mut self, buffer: impl Into<String>) -> Self {
        self.writes.push(buffer.into());
        self
    }

    pub fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    pub fn is_reduction(&self) -> bool {
        self.iter_vars.iter().any(|iv| iv.kind == IterKind::Reduce)
    }
}

/// Function attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_symbol: Option<String>,
    #[serde(default)]
    pub noalias: bool,
}

/// A primitive tensor function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimFunc {
    /// Formal parameters in declaration order
    pub params: Vec<String>,
    /// Parameter name -> buffer bound to it
    #[serde(default)]
    pub buffer_map: BTreeMap<String, Buffer>,
    /// Function-local intermediate buffers
    #[serde(default)]
    pub alloc_buffers: Vec<Buffer>,
    #[serde(default)]
    pub attrs: FuncAttrs,
    #[serde(default)]
    pub body: Vec<Block>,
}

impl PrimFunc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter bound to `buffer`
    pub fn with_param(mut self, param: impl Into<String>, buffer: Buffer) -> Self {
        let param = param.into();
        self.params.push(param.clone());
        self.buffer_map.insert(param, buffer);
        self
    }

    /// Append a parameter without buffer metadata (opaque handle)
    pub fn with_handle(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_alloc(mut self, buffer: Buffer) -> Self {
        self.alloc_buffers.push(buffer);
        self
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.body.push(block);
        self
    }

    pub fn with_global_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.attrs.global_symbol = Some(symbol.into());
        self
    }

    pub fn with_noalias(mut self, noalias: bool) -> Self {
        self.attrs.noalias = noalias;
        self
    }

    pub fn global_symbol(&self) -> Option<&str> {
        self.attrs.global_symbol.as_deref()
    }

    /// Buffer bound to a formal parameter
    pub fn param_buffer(&self, param: &str) -> Option<&Buffer> {
        self.buffer_map.get(param)
    }

    /// Every buffer visible in the body: parameter buffers then allocations
    pub fn visible_buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.params
            .iter()
            .filter_map(|p| self.buffer_map.get(p))
            .chain(self.alloc_buffers.iter())
    }

    pub fn find_buffer(&self, name: &str) -> Option<&Buffer> {
        self.visible_buffers().find(|b| b.name == name)
    }
}
