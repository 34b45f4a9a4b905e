// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sleep policies for the serve loop and the sync handshake.
//!
//! The serve loop uses an adaptive ladder: a batch of attempts with no
//! delay at all, then a few at the minimum delay, then exponentially
//! growing delays up to a cap. The attempt counter is managed by the
//! caller: it grows on empty polls and shrinks on served requests, so a
//! busy server polls hot and an idle one goes quiet.

use std::time::Duration;

/// Minimum (and base) sleep of the serve-loop ladder.
const BACKOFF_SERVER_MAX: Duration = Duration::from_micros(1);

/// Ladder shape: attempts with no delay, then minimum delay, then
/// exponential delay.
const NO_DELAY_ATTEMPTS: u32 = 1024;
const MIN_DELAY_ATTEMPTS: u32 = 4;
const EXP_DELAY_ATTEMPTS: u32 = 4;

const TOTAL_ATTEMPTS: u32 =
    NO_DELAY_ATTEMPTS + MIN_DELAY_ATTEMPTS + EXP_DELAY_ATTEMPTS;

/// Sleep between probes of the sync loop.
const BACKOFF_SYNC: Duration = Duration::from_micros(10);

/// Sleep before retrying a rejected sync request.
const BACKOFF_SYNC_REJECTED: Duration = Duration::from_micros(100);

/// One step of the serve-loop ladder at position `attempt`.
///
/// Returns `(again, slept)`: `again` is false once the ladder is
/// exhausted and the caller should yield to the outer loop; `slept`
/// reports whether this step actually slept (the caller budgets sleeps
/// separately from polls).
pub fn backoff_server(attempt: u32) -> (bool, bool) {
    if attempt < NO_DELAY_ATTEMPTS {
        return (true, false);
    }

    let delay = if attempt < NO_DELAY_ATTEMPTS + MIN_DELAY_ATTEMPTS {
        BACKOFF_SERVER_MAX
    } else {
        let exponent = (attempt - NO_DELAY_ATTEMPTS - MIN_DELAY_ATTEMPTS + 1)
            .min(EXP_DELAY_ATTEMPTS);
        BACKOFF_SERVER_MAX * 2u32.pow(exponent)
    };
    std::thread::sleep(delay);
    (attempt < TOTAL_ATTEMPTS - 1, true)
}

/// Sleep between rounds of the sync probe loop.
pub fn backoff_sync() {
    std::thread::sleep(BACKOFF_SYNC);
}

/// Sleep before resending a rejected sync request.
pub fn backoff_sync_rejected() {
    std::thread::sleep(BACKOFF_SYNC_REJECTED);
}
