use super::{BuildInput, BuildResult, Builder};
use async_trait::async_trait;

/// Builder that delegates the whole batch to caller-supplied logic
///
/// No isolation and no timeouts: whatever the closure returns is the result.
/// Used to substitute build behaviour in tests and experiments.
pub struct FnBuilder<F> {
    f: F,
}

impl<F> FnBuilder<F>
where
    F: Fn(&[BuildInput]) -> Vec<BuildResult> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Builder for FnBuilder<F>
where
    F: Fn(&[BuildInput]) -> Vec<BuildResult> + Send + Sync,
{
    async fn build(&self, inputs: &[BuildInput]) -> Vec<BuildResult> {
        let results = (self.f)(inputs);
        assert_eq!(
            results.len(),
            inputs.len(),
            "builder logic returned {} results for {} inputs",
            results.len(),
            inputs.len()
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotune_ir::{IRModule, Target};

    fn inputs(n: usize) -> Vec<BuildInput> {
        (0..n)
            .map(|_| BuildInput::new(IRModule::new(), Target::new("llvm")))
            .collect()
    }

    #[tokio::test]
    async fn test_fn_builder_all_errors() {
        let builder = FnBuilder::new(|inputs: &[BuildInput]| {
            inputs.iter().map(|_| BuildResult::failure("error")).collect()
        });
        let results = builder.build(&inputs(3)).await;
        assert_eq!(results.len(), 3);
        for result in &results {
            assert_eq!(result.artifact_path(), None);
            assert_eq!(result.error_msg(), Some("error"));
        }
    }

    #[tokio::test]
    async fn test_fn_builder_empty_batch() {
        let builder = FnBuilder::new(|_: &[BuildInput]| Vec::new());
        assert!(builder.build(&[]).await.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "returned 1 results for 2 inputs")]
    async fn test_fn_builder_length_contract() {
        let builder = FnBuilder::new(|_: &[BuildInput]| vec![BuildResult::failure("error")]);
        builder.build(&inputs(2)).await;
    }
}
