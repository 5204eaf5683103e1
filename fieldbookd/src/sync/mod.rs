pub mod backoff;
pub mod cache;
pub mod connectivity;
pub mod orchestrator;
pub mod queue;
pub mod replay;
pub mod store;

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
