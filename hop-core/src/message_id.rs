//! Message ID generation.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use crate::protocol::MessageId;

/// Random message ID. Uses OS entropy; falls back to the thread-local PRNG if the OS source fails.
pub fn generate() -> MessageId {
    let mut buf = [0u8; 1];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => buf[0],
        Err(e) => {
            tracing::debug!(error = %e, "OS entropy unavailable, using thread rng for message id");
            rand::thread_rng().gen()
        }
    }
}
