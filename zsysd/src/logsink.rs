use crate::rpc::{LogLevel, LogRecord};
use slog::{Drain, OwnedKVList, Record};
use tokio::sync::mpsc::Sender;

/// A `slog::Drain` that forwards every record to a bounded channel as a
/// wire `LogRecord`, dropping it instead of blocking when the channel is
/// full — a client that stops reading its stream loses log lines, not the
/// request itself.
pub struct ChannelDrain {
    sender: Sender<LogRecord>,
}

impl ChannelDrain {
    pub fn new(sender: Sender<LogRecord>) -> Self {
        Self { sender }
    }
}

impl Drain for ChannelDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record, _values: &OwnedKVList) -> Result<(), Self::Err> {
        let record = LogRecord {
            level: wire_level(record.level()),
            message: record.msg().to_string(),
        };
        let _ = self.sender.try_send(record);
        Ok(())
    }
}

fn wire_level(level: slog::Level) -> LogLevel {
    match level {
        slog::Level::Critical | slog::Level::Error => LogLevel::Error,
        slog::Level::Warning => LogLevel::Warning,
        slog::Level::Info => LogLevel::Info,
        slog::Level::Debug => LogLevel::Debug,
        slog::Level::Trace => LogLevel::Trace,
    }
}
