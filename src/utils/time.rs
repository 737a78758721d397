use jiff::Timestamp;

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;

/// Convert a FILETIME (100ns ticks since 1601-01-01) to a timestamp.
#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> Option<Timestamp> {
    let secs = (filetime / 10_000_000) as i64 - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as i32;
    Timestamp::new(secs, nanos).ok()
}

/// Convert a timestamp to a FILETIME, clamping times before 1601 to zero.
#[inline]
pub(crate) fn timestamp_to_filetime(ts: Timestamp) -> u64 {
    let secs = ts.as_second() + WINDOWS_TO_UNIX_SECS;
    if secs < 0 {
        return 0;
    }
    let ticks = (ts.subsec_nanosecond().max(0) as u64) / 100;
    (secs as u64) * 10_000_000 + ticks
}

/// `EVENTLOGRECORD` times are seconds since 1970-01-01 UTC in a `u32`.
#[inline]
pub(crate) fn unix_secs_to_timestamp(secs: u32) -> Timestamp {
    // Every `u32` second count is inside jiff's supported range.
    Timestamp::from_second(i64::from(secs)).unwrap_or(Timestamp::UNIX_EPOCH)
}

/// Clamp a timestamp into the `u32` seconds range used on the wire.
#[inline]
pub(crate) fn timestamp_to_unix_secs(ts: Timestamp) -> u32 {
    ts.as_second().clamp(0, i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_roundtrip() {
        let ts: Timestamp = "2024-03-01T12:30:45.1234567Z".parse().unwrap();
        let ft = timestamp_to_filetime(ts);
        assert_eq!(filetime_to_timestamp(ft), Some(ts));
    }

    #[test]
    fn test_filetime_epoch() {
        let ts = filetime_to_timestamp(116_444_736_000_000_000).unwrap();
        assert_eq!(ts, Timestamp::UNIX_EPOCH);
    }

    #[test]
    fn test_unix_secs_clamp() {
        let ts: Timestamp = "1960-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(timestamp_to_unix_secs(ts), 0);
        assert_eq!(unix_secs_to_timestamp(86_400).to_string(), "1970-01-02T00:00:00Z");
    }
}
