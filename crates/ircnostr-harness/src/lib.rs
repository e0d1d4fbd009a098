//! Test harness for the IRC/Nostr bridge
//!
//! Mock collaborators that stand in for an IRC server and Nostr relays. They
//! count calls, record traffic and can be told to fail, so tests can check
//! what the bridge did on the wire without any network.

pub mod chat;
pub mod relay;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use chat::{ChatCommand, MockChatClient, MockConnection};
pub use relay::{MockProfileLookup, MockRelay, MockRelayPool};

/// How often the `wait_*` helpers re-check their condition
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wait until `condition` holds
///
/// Polls on the tokio clock, so it also works with paused time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// A panicking test thread must not poison the mocks for the rest of the test
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
