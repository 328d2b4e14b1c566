use std::{sync::Arc, time::Instant};

use crate::{
    Envelope,
    dispatcher::{DispatchError, Dispatcher},
    subscriber::Subscriber,
};

/// Runs the callback inline, no retry.
pub struct SyncDispatcher {
    subscriber: Arc<dyn Subscriber>,
}

impl SyncDispatcher {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self { subscriber }
    }
}

#[async_trait::async_trait]
impl Dispatcher for SyncDispatcher {
    #[tracing::instrument(skip_all, fields(id = %envelope.id(), event_type = %envelope.event_type()))]
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let started = Instant::now();
        let result = super::invoke(self.subscriber.as_ref(), &envelope).await;
        tracing::trace!(elapsed = ?started.elapsed(), ok = result.is_ok(), "Callback finished");
        result.map_err(DispatchError::callback)
    }
}
