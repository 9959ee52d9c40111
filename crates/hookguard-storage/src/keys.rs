use hookguard_types::IdempotencyKey;

/// `records` keyspace: `key_utf8`
pub fn record_key(key: &IdempotencyKey) -> Vec<u8> {
    key.as_str().as_bytes().to_vec()
}

/// `leases` keyspace: `key_utf8`
pub fn lease_key(key: &IdempotencyKey) -> Vec<u8> {
    key.as_str().as_bytes().to_vec()
}

/// `terminal_index` keyspace: `updated_at_ns_be_i64(8) ++ key_utf8`
///
/// Big-endian i64 preserves sort order for all positive unix nanosecond
/// values, so a forward scan visits the oldest terminal records first.
pub fn terminal_index_key(updated_at_ns: i64, key: &IdempotencyKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.as_str().len());
    buf.extend_from_slice(&updated_at_ns.to_be_bytes());
    buf.extend_from_slice(key.as_str().as_bytes());
    buf
}

/// Exclusive upper bound for terminal index entries updated before `cutoff_ns`.
pub fn terminal_index_bound(cutoff_ns: i64) -> [u8; 8] {
    cutoff_ns.to_be_bytes()
}

/// Split a `terminal_index` key back into `(updated_at_ns, key)`.
pub fn parse_terminal_index_key(raw: &[u8]) -> Option<(i64, IdempotencyKey)> {
    if raw.len() <= 8 {
        return None;
    }
    let ts = i64::from_be_bytes(raw[..8].try_into().ok()?);
    let key = std::str::from_utf8(&raw[8..]).ok()?;
    Some((ts, IdempotencyKey::new(key).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    #[test]
    fn terminal_index_sorts_by_time() {
        let early = terminal_index_key(1_000_000_000, &key("z"));
        let late = terminal_index_key(2_000_000_000, &key("a"));
        assert!(early < late);
    }

    #[test]
    fn terminal_index_same_time_sorts_by_key() {
        let a = terminal_index_key(1_000, &key("a"));
        let b = terminal_index_key(1_000, &key("b"));
        assert!(a < b);
    }

    #[test]
    fn bound_excludes_cutoff() {
        let at_cutoff = terminal_index_key(5_000, &key("k"));
        let before = terminal_index_key(4_999, &key("k"));
        let bound = terminal_index_bound(5_000);
        assert!(before.as_slice() < bound.as_slice());
        assert!(at_cutoff.as_slice() >= bound.as_slice());
    }

    #[test]
    fn parse_round_trips() {
        let raw = terminal_index_key(42, &key("evt_1"));
        let (ts, k) = parse_terminal_index_key(&raw).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(k.as_str(), "evt_1");
        assert!(parse_terminal_index_key(&raw[..8]).is_none());
    }

    #[test]
    fn record_key_is_raw_utf8() {
        assert_eq!(record_key(&key("evt_1")), b"evt_1");
    }
}
