//! Server-side sessions.
//!
//! A session maps a UUID to the backend token and TOTP state of a logged-in
//! user. Browsers only ever see the session id wrapped in a [`SessionToken`],
//! sealed by an [`Envelope`].

mod codec;
mod envelope;
mod store;

pub use codec::{CodecError, SessionToken};
pub use envelope::Envelope;
pub use store::{SessionEntry, SessionStore, StoreError};

use crate::totp::TotpState;

impl SessionToken {
    /// Wire token for `session_id` carrying the flags of `totp`.
    #[must_use]
    pub fn from_state(session_id: &str, totp: &TotpState) -> Self {
        Self {
            session_id: session_id.to_string(),
            verify_required: totp.verify_required,
            enabled: totp.enabled,
            retry_count: totp.retry_count,
            lock_expire: totp.lock_expire,
        }
    }
}

#[cfg(test)]
pub(crate) use envelope::tests::{TEST_PRIVATE_KEY_PEM, test_envelope};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wire_token_round_trips_through_both_envelopes() {
        let mut totp = TotpState::new(true, true);
        totp.record_failure(1_700_000_000);
        let token = SessionToken::from_state("2f1e0c53-5d1d-4a43-b4e7-8b1b3b0f7f2a", &totp);

        for envelope in [Envelope::plain(), test_envelope()] {
            let wire = token.encode(&envelope).unwrap();
            assert_eq!(SessionToken::decode(&wire, &envelope).unwrap(), token);
        }
    }

    #[test]
    fn plain_token_is_not_accepted_by_encrypted_envelope() {
        let token = SessionToken::new("sid");
        let wire = token.encode(&Envelope::plain()).unwrap();
        assert!(SessionToken::decode(&wire, &test_envelope()).is_err());
    }
}
