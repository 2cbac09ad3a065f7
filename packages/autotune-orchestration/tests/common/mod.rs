//! Shared fixtures: small tensor programs

#![allow(dead_code)]

use autotune_ir::{Block, Buffer, IRModule, IterVar, PrimFunc};
use autotune_orchestration::{BuildInput, BuildResult, Target};
use std::path::Path;

/// C[i, j] += A[i, k] * B[k, j]
pub fn matmul(n: i64, m: i64, k: i64) -> IRModule {
    let func = PrimFunc::new()
        .with_param("a", Buffer::new("A", "float32", [n, k]))
        .with_param("b", Buffer::new("B", "float32", [k, m]))
        .with_param("c", Buffer::new("C", "float32", [n, m]))
        .with_global_symbol("main")
        .with_noalias(true)
        .with_block(
            Block::new("matmul")
                .with_iter(IterVar::spatial("vi", n as u64))
                .with_iter(IterVar::spatial("vj", m as u64))
                .with_iter(IterVar::reduce("vk", k as u64))
                .reads("A")
                .reads("B")
                .writes("C")
                .with_init(),
        );
    IRModule::from_func("main", func)
}

/// D = relu(A @ B), with the product in a local buffer
pub fn matmul_relu(n: i64, m: i64, k: i64) -> IRModule {
    let func = PrimFunc::new()
        .with_param("a", Buffer::new("A", "float32", [n, k]))
        .with_param("b", Buffer::new("B", "float32", [k, m]))
        .with_param("d", Buffer::new("D", "float32", [n, m]))
        .with_alloc(Buffer::new("C", "float32", [n, m]))
        .with_global_symbol("main")
        .with_block(
            Block::new("matmul")
                .with_iter(IterVar::spatial("vi", n as u64))
                .with_iter(IterVar::spatial("vj", m as u64))
                .with_iter(IterVar::reduce("vk", k as u64))
                .reads("A")
                .reads("B")
                .writes("C")
                .with_init(),
        )
        .with_block(
            Block::new("relu")
                .with_iter(IterVar::spatial("vi", n as u64))
                .with_iter(IterVar::spatial("vj", m as u64))
                .reads("C")
                .writes("D"),
        );
    IRModule::from_func("main", func)
}

/// C[b, i, j] += A[b, i, k] * B[b, k, j]
pub fn batch_matmul(batch: i64, n: i64, m: i64, k: i64) -> IRModule {
    let func = PrimFunc::new()
        .with_param("a", Buffer::new("A", "float32", [batch, n, k]))
        .with_param("b", Buffer::new("B", "float32", [batch, k, m]))
        .with_param("c", Buffer::new("C", "float32", [batch, n, m]))
        .with_global_symbol("main")
        .with_block(
            Block::new("bmm")
                .with_iter(IterVar::spatial("vb", batch as u64))
                .with_iter(IterVar::spatial("vi", n as u64))
                .with_iter(IterVar::spatial("vj", m as u64))
                .with_iter(IterVar::reduce("vk", k as u64))
                .reads("A")
                .reads("B")
                .writes("C")
                .with_init(),
        );
    IRModule::from_func("main", func)
}

pub fn llvm() -> Target {
    Target::parse("llvm -num-cores=1").unwrap()
}

pub fn inputs(programs: Vec<IRModule>) -> Vec<BuildInput> {
    programs
        .into_iter()
        .map(|p| BuildInput::new(p, llvm()))
        .collect()
}

/// Every result has exactly one of its fields set
pub fn assert_exactly_one(results: &[BuildResult]) {
    for (i, result) in results.iter().enumerate() {
        assert!(
            result.artifact_path().is_some() != result.error_msg().is_some(),
            "result {} breaks the exactly-one invariant: {:?}",
            i,
            result
        );
    }
}

/// Remove an artifact and the directory created for it
pub fn remove_artifact(path: &Path) {
    assert!(path.is_file(), "missing artifact {}", path.display());
    std::fs::remove_file(path).unwrap();
    std::fs::remove_dir(path.parent().unwrap()).unwrap();
}
