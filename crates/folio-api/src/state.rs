use std::{sync::Arc, time::Duration};

use folio_jobs::{Dispatcher, EventStreamManager, JobStore};

pub struct AppState {
    pub store: JobStore,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub events: EventStreamManager,
    /// Wait per stream read before a keep-alive frame is sent.
    pub stream_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: JobStore,
        dispatcher: Arc<dyn Dispatcher>,
        events: EventStreamManager,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            stream_timeout,
        }
    }
}
