use std::future::Future;

use tracing::warn;

/// Awaits a delivery and swallows its failure. The state change that
/// triggered the message has already been committed and stays committed.
pub(crate) async fn deliver<F>(notification: &'static str, delivery: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(err) = delivery.await {
        warn!(notification, error = %format!("{err:#}"), "notification delivery failed");
    }
}
