//! Output names for socket sessions.

use chrono::{DateTime, Timelike, Utc};

use crate::frame::Header;

/// Names an output after the frame that opened it:
/// `<prefix>-YYYYMMDDTHHMM<SS.sss>Z`, plus `-SSS` for a station output.
///
/// The timestamp is the header's raw time, before any correction.
///
/// ```
/// use tbb_ingest::frame::Header;
/// use tbb_ingest::runtime::timestamped_name;
///
/// let header = Header {
///     station: 7,
///     epoch_second: 1_262_304_001,
///     sample_offset: 100_000_000,
///     ..Header::default()
/// };
/// assert_eq!(timestamped_name("tbb", &header, None), "tbb-20100101T000001.500Z");
/// assert_eq!(timestamped_name("tbb", &header, Some(7)), "tbb-20100101T000001.500Z-007");
/// ```
#[must_use]
pub fn timestamped_name(prefix: &str, header: &Header, station: Option<u8>) -> String {
    let time = DateTime::<Utc>::from_timestamp(i64::from(header.epoch_second), 0).unwrap_or_default();

    let rate = header.sample_rate_hz();
    let fraction = if rate > 0 {
        f64::from(header.sample_offset) / rate as f64
    } else {
        0.0
    };
    let seconds = f64::from(time.second()) + fraction;

    let mut name = format!("{prefix}-{}{seconds:06.3}Z", time.format("%Y%m%dT%H%M"));
    if let Some(station) = station {
        name.push_str(&format!("-{station:03}"));
    }
    name
}

/// Returns `base` if `exists` says it is free, else the first free
/// `base-<n>` for n = 0, 1, ...
pub fn unique_name(base: &str, exists: impl Fn(&str) -> bool) -> String {
    if !exists(base) {
        return base.to_owned();
    }
    (0u64..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !exists(candidate))
        .unwrap_or_else(|| base.to_owned())
}
