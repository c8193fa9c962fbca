//! Session identifier generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated session identifiers.
pub const SESSION_ID_LEN: usize = 48;

/// A fresh random identifier of [`SESSION_ID_LEN`] alphanumeric characters.
pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Whether a client-presented identifier could have been issued by us.
pub fn is_well_formed(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}
