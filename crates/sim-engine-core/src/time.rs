//! UTC timestamp helpers. All database timestamps are timezone-aware UTC;
//! use these instead of constructing `DateTime` directly so naive/aware
//! values never mix.

use chrono::{DateTime, TimeZone, Utc};

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Coerce a possibly-naive timestamp to UTC. Rows written before the engine
/// consistently stamped `created_at` in UTC are treated as already-UTC.
pub fn ensure_utc(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_utc_is_idempotent() {
        let t = now_utc();
        assert_eq!(ensure_utc(t), t);
    }
}
