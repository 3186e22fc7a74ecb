//! Wall-clock helpers. Timestamps on the wire are epoch milliseconds.

use chrono::Utc;

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_tracks_chrono() {
        let before = Utc::now().timestamp_millis() as u64;
        let now = now_millis();
        assert!(now >= before);
        assert!(now - before < 1_000);
    }
}
