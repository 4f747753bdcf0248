//! Optional background revalidation.
//!
//! The core never refetches on its own; a consumer that wants expired data
//! refreshed while it stays subscribed opts in here.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::manager::CacheManager;

/// Every `interval`, refetch subscribed keys whose max age has elapsed.
///
/// The task holds only a weak reference and exits once the manager is
/// dropped. Abort the handle to stop it earlier.
pub fn spawn_revalidation<V>(manager: &Arc<CacheManager<V>>, interval: Duration) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    let manager: Weak<CacheManager<V>> = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                debug!("Cache dropped, stopping revalidation");
                break;
            };
            manager.revalidate_expired();
        }
    })
}
