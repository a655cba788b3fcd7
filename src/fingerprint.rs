//! Content fingerprinting and the two-slot echo-guard that prevents
//! retransmission of content we just sent or just received.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 digest of `payload`.
pub fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// The `(last_sent, last_received)` pair. Consulted on every outbound
/// candidate and updated on every successful send/receive.
#[derive(Debug, Default, Clone)]
pub struct EchoGuard {
    last_sent: Option<String>,
    last_received: Option<String>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` iff `fp` matches neither slot — i.e. it is safe to send.
    pub fn should_send(&self, fp: &str) -> bool {
        self.last_sent.as_deref() != Some(fp) && self.last_received.as_deref() != Some(fp)
    }

    /// Call only after the outgoing frame has been fully flushed to the
    /// peer — marking it sent before the flush succeeds would suppress a
    /// retry if the write fails partway through.
    pub fn record_sent(&mut self, fp: String) {
        self.last_sent = Some(fp);
    }

    /// Call before any X operation that mutates a selection using this
    /// payload, so the resulting ownership-change notification is already
    /// recognized as ours by the time it's observed.
    pub fn record_received(&mut self, fp: String) {
        self.last_received = Some(fp);
    }

    /// Resets both slots, e.g. on client reconnect.
    pub fn clear(&mut self) {
        self.last_sent = None;
        self.last_received = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinguishes_content() {
        let a = fingerprint(b"foo");
        let b = fingerprint(b"foo");
        let c = fingerprint(b"bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fresh_guard_allows_everything() {
        let guard = EchoGuard::new();
        assert!(guard.should_send(&fingerprint(b"anything")));
    }

    #[test]
    fn suppresses_just_sent() {
        let mut guard = EchoGuard::new();
        let fp = fingerprint(b"foo");
        guard.record_sent(fp.clone());
        assert!(!guard.should_send(&fp));
    }

    #[test]
    fn suppresses_just_received() {
        let mut guard = EchoGuard::new();
        let fp = fingerprint(b"foo");
        guard.record_received(fp.clone());
        assert!(!guard.should_send(&fp));
    }

    #[test]
    fn distinct_content_is_not_suppressed() {
        let mut guard = EchoGuard::new();
        guard.record_sent(fingerprint(b"foo"));
        assert!(guard.should_send(&fingerprint(b"bar")));
    }

    #[test]
    fn clear_resets_both_slots() {
        let mut guard = EchoGuard::new();
        let fp = fingerprint(b"x");
        guard.record_sent(fp.clone());
        guard.clear();
        assert!(guard.should_send(&fp));
    }

    #[test]
    fn two_selections_changing_to_the_same_content_send_only_once() {
        // Both CLIPBOARD and PRIMARY transition to the same text in one
        // burst: only the first should be considered sendable.
        let mut guard = EchoGuard::new();
        let fp = fingerprint(b"bar");
        assert!(guard.should_send(&fp));
        guard.record_sent(fp.clone());
        assert!(!guard.should_send(&fp));
    }

    #[test]
    fn content_held_since_before_a_reconnect_resends_after_clear() {
        // The local selection still holds what we last sent; after a
        // reconnect the guard is cleared, so the same content is eligible
        // to go out again rather than staying suppressed forever.
        let mut guard = EchoGuard::new();
        let fp = fingerprint(b"x");
        guard.record_sent(fp.clone());
        assert!(!guard.should_send(&fp));

        guard.clear();
        assert!(guard.should_send(&fp));
    }
}
