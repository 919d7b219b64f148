//! In-process counters, logged periodically via `tracing` rather than
//! exported over HTTP (a real metrics exporter is out of scope; counting and
//! logging the numbers is not).

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub libraries_connected: u64,
    pub libraries_timed_out: u64,
    pub sessions_requested: u64,
    pub sessions_released: u64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) {
        tracing::info!(
            libraries_connected = self.libraries_connected,
            libraries_timed_out = self.libraries_timed_out,
            sessions_requested = self.sessions_requested,
            sessions_released = self.sessions_released,
            "engine counters"
        );
    }
}
