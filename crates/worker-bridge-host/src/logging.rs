//! Guest logging.
//!
//! Guest log lines are kept in the [`GuestState`] of the call that produced
//! them and re-emitted through `tracing`. Messages are cut to
//! [`MAX_LOG_MESSAGE_BYTES`](worker_bridge_core::MAX_LOG_MESSAGE_BYTES) and a
//! call keeps at most [`MAX_LOG_ENTRIES`] lines.

use tracing::{debug, error, info, warn};
use worker_bridge_core::{GuestState, LogLevel, MAX_LOG_ENTRIES, truncate_message};

/// Host implementation of `env.log`.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    ///
    /// Lines past the per-call limit are dropped; the first dropped line is
    /// reported once.
    pub fn log(state: &mut GuestState, level: LogLevel, message: &str) {
        let mut message = message.to_string();
        truncate_message(&mut message);

        if !state.log(level, message.clone()) {
            if state.dropped_logs == 1 {
                warn!(
                    invocation_id = state.invocation_id.as_str(),
                    limit = MAX_LOG_ENTRIES,
                    "Guest log limit reached, dropping further lines"
                );
            }
            return;
        }

        let invocation_id = state.invocation_id.as_str();
        match level {
            LogLevel::Debug => debug!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(invocation_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values log at info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}
