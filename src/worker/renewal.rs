//! Lease keep-alive for an in-flight message.

use std::convert::Infallible;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::model::{Lease, Payload};
use crate::queue::Queue;

/// Renew `lease` every `every` until dropped, updating it in place.
///
/// Never completes: once the lease is found lost it parks, so the caller can
/// race it against the handler and simply drop it when the handler is done.
/// `lease` is left at the last expiry the store confirmed.
pub(crate) async fn keep_alive<P: Payload>(
    queue: &Queue<P>,
    lease: &mut Lease,
    every: Duration,
) -> Infallible {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match queue.renew(lease).await {
            Ok(true) => {
                debug!(id = %lease.id, until = %lease.reset_timestamp, "lease renewed");
            }
            Ok(false) => {
                warn!(id = %lease.id, "lease lost while processing, renewal stopped");
                break;
            }
            Err(e) => {
                warn!(id = %lease.id, "lease renewal failed, retrying next tick: {e}");
            }
        }
    }

    std::future::pending().await
}
