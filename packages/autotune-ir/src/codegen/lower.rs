use super::{BuildParams, CompiledFunction, CompiledModule};
use crate::arg_info::ArgInfo;
use crate::errors::{IrError, Result};
use crate::program::{Block, IRModule, IterKind, PrimFunc};
use crate::target::Target;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use tracing::debug;

/// Target kinds the default routine can lower to
pub const SUPPORTED_TARGET_KINDS: &[&str] = &["llvm", "c"];

/// Standard compilation routine
///
/// Validates the module against the target, derives every function's
/// signature and renders a deterministic source listing.
pub fn default_build(
    module: &IRModule,
    target: &Target,
    params: Option<&BuildParams>,
) -> Result<CompiledModule> {
    if !SUPPORTED_TARGET_KINDS.contains(&target.kind()) {
        return Err(IrError::lowering(format!(
            "unsupported target kind '{}' (supported: {})",
            target.kind(),
            SUPPORTED_TARGET_KINDS.join(", ")
        )));
    }
    if module.is_empty() {
        return Err(IrError::lowering("module has no functions"));
    }

    let mut source = format!("// target: {}\n", target);
    let mut functions = Vec::with_capacity(module.len());

    for (name, func) in module.iter() {
        let symbol = func.global_symbol().unwrap_or(name).to_string();
        let args = ArgInfo::from_prim_func(func)?;
        check_body(&symbol, func)?;
        emit_function(&mut source, &symbol, func, &args);
        functions.push(CompiledFunction { symbol, args });
    }

    let fingerprint = Sha256::digest(source.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{:02x}", byte);
            hex
        });

    debug!(
        "Lowered {} function(s) for '{}' (fingerprint {})",
        functions.len(),
        target,
        &fingerprint[..12]
    );

    Ok(CompiledModule {
        target: target.clone(),
        functions,
        source,
        fingerprint,
        params: params.cloned().unwrap_or_default(),
    })
}

fn check_body(symbol: &str, func: &PrimFunc) -> Result<()> {
    for buffer in &func.alloc_buffers {
        if let Some(extent) = buffer.shape.iter().find(|&&e| e < 0) {
            return Err(IrError::lowering(format!(
                "{}: buffer '{}' has negative extent {}",
                symbol, buffer.name, extent
            )));
        }
    }

    for block in &func.body {
        if let Some(iv) = block.iter_vars.iter().find(|iv| iv.extent == 0) {
            return Err(IrError::lowering(format!(
                "{}: block '{}' iterates '{}' over an empty range",
                symbol, block.name, iv.name
            )));
        }
        for buffer in block.reads.iter().chain(block.writes.iter()) {
            if func.find_buffer(buffer).is_none() {
                return Err(IrError::lowering(format!(
                    "{}: block '{}' accesses undeclared buffer '{}'",
                    symbol, block.name, buffer
                )));
            }
        }
    }
    Ok(())
}

fn emit_function(out: &mut String, symbol: &str, func: &PrimFunc, args: &ArgInfo) {
    let restrict = if func.attrs.noalias { " restrict" } else { "" };
    let params: Vec<String> = func
        .params
        .iter()
        .zip(args.iter())
        .map(|(param, info)| format!("{}*{} {} /* {:?} */", info.dtype(), restrict, param, info.shape()))
        .collect();

    let _ = writeln!(out, "\nint32_t {}({}) {{", symbol, params.join(", "));
    for buffer in &func.alloc_buffers {
        let _ = writeln!(out, "  {} {}{:?};", buffer.dtype, buffer.name, buffer.shape);
    }
    for block in &func.body {
        emit_block(out, block);
    }
    let _ = writeln!(out, "  return 0;\n}}");
}

fn emit_block(out: &mut String, block: &Block) {
    let _ = writeln!(
        out,
        "  // block {}{}",
        block.name,
        if block.is_reduction() { " (reduction)" } else { "" }
    );
    let mut depth = 1;
    for iv in &block.iter_vars {
        let indent = "  ".repeat(depth);
        let tag = match iv.kind {
            IterKind::Spatial => "",
            IterKind::Reduce => " // reduce",
        };
        let _ = writeln!(
            out,
            "{}for (int64_t {} = 0; {} < {}; ++{}) {{{}",
            indent, iv.name, iv.name, iv.extent, iv.name, tag
        );
        depth += 1;
    }
    let indent = "  ".repeat(depth);
    let _ = writeln!(
        out,
        "{}{} <- f({});",
        indent,
        block.writes.join(", "),
        block.reads.join(", ")
    );
    for level in (1..depth).rev() {
        let _ = writeln!(out, "{}}}", "  ".repeat(level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Buffer, IterVar};

    fn vector_add() -> IRModule {
        let func = PrimFunc::new()
            .with_param("a", Buffer::new("A", "float32", [64]))
            .with_param("b", Buffer::new("B", "float32", [64]))
            .with_param("c", Buffer::new("C", "float32", [64]))
            .with_global_symbol("vadd")
            .with_block(
                Block::new("add")
                    .with_iter(IterVar::spatial("vi", 64))
                    .reads("A")
                    .reads("B")
                    .writes("C"),
            );
        IRModule::from_func("vadd", func)
    }

    #[test]
    fn test_default_build_vector_add() {
        let compiled = default_build(&vector_add(), &Target::new("llvm"), None).unwrap();
        assert_eq!(compiled.functions.len(), 1);
        let func = compiled.function("vadd").unwrap();
        assert_eq!(func.args.len(), 3);
        assert!(compiled.source.contains("int32_t vadd("));
        assert!(compiled.source.contains("for (int64_t vi = 0; vi < 64; ++vi)"));
        assert_eq!(compiled.fingerprint.len(), 64);
    }

    #[test]
    fn test_default_build_is_deterministic() {
        let target = Target::new("c");
        let a = default_build(&vector_add(), &target, None).unwrap();
        let b = default_build(&vector_add(), &target, None).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        let other = default_build(&vector_add(), &Target::new("llvm"), None).unwrap();
        assert_ne!(a.fingerprint, other.fingerprint);
    }

    #[test]
    fn test_default_build_carries_params() {
        let mut params = BuildParams::new();
        params.insert("opt_level".to_string(), serde_json::json!(3));
        let compiled = default_build(&vector_add(), &Target::new("llvm"), Some(&params)).unwrap();
        assert_eq!(compiled.params, params);
    }

    #[test]
    fn test_default_build_rejects_unsupported_target() {
        let err = default_build(&vector_add(), &Target::new("cuda"), None).unwrap_err();
        assert!(matches!(err, IrError::Lowering(_)));
        assert!(err.to_string().contains("cuda"));
    }

    #[test]
    fn test_default_build_rejects_empty_module() {
        assert!(default_build(&IRModule::new(), &Target::new("llvm"), None).is_err());
    }

    #[test]
    fn test_default_build_rejects_undeclared_buffer() {
        let func = PrimFunc::new()
            .with_param("a", Buffer::new("A", "float32", [4]))
            .with_block(
                Block::new("bad")
                    .with_iter(IterVar::spatial("i", 4))
                    .reads("A")
                    .writes("Z"),
            );
        let err = default_build(&IRModule::from_func("f", func), &Target::new("llvm"), None)
            .unwrap_err();
        assert!(err.to_string().contains("undeclared buffer 'Z'"));
    }

    #[test]
    fn test_default_build_rejects_empty_iteration() {
        let func = PrimFunc::new()
            .with_param("a", Buffer::new("A", "float32", [4]))
            .with_block(Block::new("noop").with_iter(IterVar::reduce("k", 0)).writes("A"));
        let err = default_build(&IRModule::from_func("f", func), &Target::new("llvm"), None)
            .unwrap_err();
        assert!(err.to_string().contains("empty range"));
    }

    #[test]
    fn test_default_build_propagates_lookup_error() {
        let func = PrimFunc::new().with_handle("opaque");
        let err = default_build(&IRModule::from_func("f", func), &Target::new("llvm"), None)
            .unwrap_err();
        assert!(err.is_lookup());
    }
}
