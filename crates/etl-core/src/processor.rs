use crate::batch::BatchResult;
use crate::error::EtlError;
use async_trait::async_trait;

/// The pull-based contract every stage of the engine implements.
///
/// Callers repeatedly ask a processor for up to `max_batch_size` rows'
/// worth of work; the processor drains its own predecessor (if any) as
/// needed to satisfy the request. Returning `Ok(None)` signals exhaustion:
/// once a processor returns `None` it must keep returning `None`.
#[async_trait]
pub trait BatchProcessor: Send {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError>;
}

/// Lets a boxed trait object stand in for a concrete predecessor type, so a
/// caller that assembles its chain dynamically (e.g. from a parsed job
/// spec) can still hand it to the generic `Struct<P: BatchProcessor>` stages.
#[async_trait]
impl BatchProcessor for Box<dyn BatchProcessor> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        (**self).get_batch(max_batch_size).await
    }
}
