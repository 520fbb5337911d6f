//! Static log rotation parameters for the broker binary, per
//! [`broker_log::StaticLogConfig`].

use broker_log::StaticLogConfig;

pub struct BrokerLog;

impl StaticLogConfig for BrokerLog {
    const MAX_BYTES_PER_LOG_FILE: u64 = 3_000_000; // 3 MB
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "broker";
}
