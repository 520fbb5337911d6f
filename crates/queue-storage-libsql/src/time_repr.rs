//! Microsecond-since-epoch time representation used for every timestamp
//! column, matching the precision `strftime`-based SQL expressions can
//! reliably produce.

use queue_core::BrokerError;
use time::OffsetDateTime;

pub fn to_micros(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos() / 1_000).unwrap_or(i64::MAX)
}

pub fn from_micros(micros: i64) -> Result<OffsetDateTime, BrokerError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|err| BrokerError::invariant(format!("stored timestamp out of range: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let now = OffsetDateTime::now_utc();
        let micros = to_micros(now);
        let back = from_micros(micros).unwrap();
        assert!((now - back).abs() < time::Duration::microseconds(1));
    }
}
