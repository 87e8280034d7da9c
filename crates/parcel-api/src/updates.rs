//! Background forwarding of backend updates into the auth session.

use std::sync::Arc;
use std::time::Duration;

use parcel_core::auth::AuthSessionManager;
use parcel_core::events::{consume_updates, pump_updates, UpdateSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const UPDATE_CHANNEL_CAPACITY: usize = 64;
const LONG_POLL_WAIT: Duration = Duration::from_secs(25);
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Spawn the poller and the consumer; both stop when either side goes away.
pub fn spawn_update_pump(
    source: Arc<dyn UpdateSource>,
    auth: Arc<AuthSessionManager>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let pump = tokio::spawn(pump_updates(source, tx, LONG_POLL_WAIT, RETRY_DELAY));
    let consumer = tokio::spawn(consume_updates(rx, auth));
    tracing::info!("Backend update pump started");
    (pump, consumer)
}
