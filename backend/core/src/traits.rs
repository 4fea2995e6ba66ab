use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Trait for the engine's long-lived loops (Generator, Processor).
///
/// Each component runs in its own Tokio task and polls until the
/// cancellation token fires, at which point it returns cleanly.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Human-readable name of this component.
    fn name(&self) -> &str;

    /// Run the component's polling loop until cancelled.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}
