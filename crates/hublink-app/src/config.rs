use std::time::Duration;

/// Configuration for an [`crate::AppContext`] and its worker.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Number of negotiable handles (`0x10..`). Predefined handles do not count.
    pub max_endpoints: usize,
    /// Request timeout used when neither the caller nor the descriptor sets one.
    /// `None` disables timeouts.
    pub default_request_timeout: Option<Duration>,
    /// Longest the worker sleeps between timeout scans when idle.
    pub timeout_scan_interval: Duration,
    /// Register the echo service at [`crate::HANDLE_LOOPBACK`] on startup.
    pub enable_loopback: bool,
    /// Name of the dispatch worker thread.
    pub worker_thread_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 16,
            default_request_timeout: Some(Duration::from_secs(1)),
            timeout_scan_interval: Duration::from_millis(100),
            enable_loopback: false,
            worker_thread_name: "hublink-app".to_string(),
        }
    }
}
