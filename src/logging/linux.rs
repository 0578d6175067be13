//! syslog/journald sink

use super::{AuditSink, LogLevel};
use std::sync::Mutex;
use syslog::{Facility, Formatter3164};

pub struct SyslogSink {
    logger: Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>,
}

impl SyslogSink {
    /// `None` when there is no /dev/log (containers, CI)
    pub fn connect() -> Option<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_LOCAL0,
            hostname: None,
            process: "permit-pilot".into(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(logger) => Some(SyslogSink { logger: Mutex::new(logger) }),
            Err(e) => {
                tracing::debug!("syslog unavailable ({}); audit events go to tracing only", e);
                None
            }
        }
    }
}

impl AuditSink for SyslogSink {
    fn write(&self, level: LogLevel, line: &str) {
        let Ok(mut logger) = self.logger.lock() else { return };
        let written = match level {
            LogLevel::Debug => logger.debug(line),
            LogLevel::Info => logger.info(line),
            LogLevel::Warning => logger.warning(line),
            LogLevel::Error => logger.err(line),
            LogLevel::Critical => logger.crit(line),
        };
        if let Err(e) = written {
            tracing::debug!("syslog write failed: {}", e);
        }
    }
}
