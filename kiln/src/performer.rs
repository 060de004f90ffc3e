use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;

use crate::error::Result;
use crate::filters::FilterPipeline;
use crate::identity::ServerId;
use crate::job::BackgroundJob;
use crate::lease::JobCancellationToken;
use crate::telemetry;

/// What a performer sees of the job it runs.
#[derive(Debug)]
pub struct PerformContext {
    pub job: BackgroundJob,
    pub server_id: ServerId,
    pub cancellation: JobCancellationToken,
}

/// Invokes the method an [`InvocationData`](crate::InvocationData) describes.
///
/// Long-running implementations should poll
/// [`JobCancellationToken::throw_if_cancellation_requested`] or race against
/// [`JobCancellationToken::cancelled`].
#[async_trait]
pub trait JobPerformer: Send + Sync {
    async fn perform(&self, ctx: &PerformContext) -> Result<Option<serde_json::Value>>;
}

/// A [`JobPerformer`] wrapped in the server filter pipeline.
#[derive(Clone)]
pub struct BackgroundJobPerformer {
    inner: Arc<dyn JobPerformer>,
    pipeline: FilterPipeline,
}

impl BackgroundJobPerformer {
    pub fn new(inner: Arc<dyn JobPerformer>, pipeline: FilterPipeline) -> Self {
        Self { inner, pipeline }
    }

    pub async fn perform(&self, ctx: &PerformContext) -> Result<Option<serde_json::Value>> {
        let span = telemetry::perform_span(&ctx.job);
        self.pipeline
            .run(&ctx.job, || async {
                ctx.cancellation.throw_if_cancellation_requested()?;
                self.inner.perform(ctx).await
            })
            .instrument(span)
            .await
    }
}
