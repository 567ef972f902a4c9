//! Grammar of the mailstore's operation log.
//!
//! A relevant line looks like
//!
//! ```text
//! Mar  4 10:15:02 mx dovecot: imap(alice@example.com)<123><abc>: copy from INBOX: box=Trash, uid=42, msgid=<m1@x>, size=512, flags=(\Seen)
//! ```
//!
//! The timestamp carries no year; it is completed from a reference time.

use chrono::{DateTime, Datelike, Local, Month, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

static RECORD: OnceLock<Regex> = OnceLock::new();
static SESSION: OnceLock<Regex> = OnceLock::new();

/// `flag_change`, `copy from <box>` or `expunge`, followed by the message coordinates.
fn record_regex() -> &'static Regex {
    RECORD.get_or_init(|| {
        Regex::new(
            r"(?P<kind>flag_change|copy from (?P<from>[^:]+)|expunge): box=(?P<box>[^,]+), uid=(?P<uid>\d+), msgid=(?P<msgid><[^>]+>)(?:.*?flags=\((?P<flags>[^)]*)\))?",
        )
        .expect("Invalid log record regex")
    })
}

/// The `imap(user@domain)` session tag naming the owning account.
fn session_regex() -> &'static Regex {
    SESSION.get_or_init(|| Regex::new(r"imap\(([^@\s)]+@[^)\s]+)\)").expect("Invalid session regex"))
}

/// Fields common to every recognized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub account: String,
    pub mailbox: String,
    pub uid: u32,
    pub message_id: String,
    /// Flag names without the leading backslash.
    pub flags: Vec<String>,
}

impl LogRecord {
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|flag| flag.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// The message was copied from `from` into `record.mailbox`.
    Move { from: String, record: LogRecord },
    /// Expunge of a message flagged `\Deleted`.
    Delete(LogRecord),
    FlagChange(LogRecord),
    Unrecognized,
}

/// Classify one log line.
pub fn parse_line(line: &str) -> LogEvent {
    let Some(caps) = record_regex().captures(line) else {
        return LogEvent::Unrecognized;
    };
    let Some(account) = session_regex().captures(line).and_then(|c| c.get(1)) else {
        return LogEvent::Unrecognized;
    };
    let Ok(uid) = caps["uid"].parse::<u32>() else {
        return LogEvent::Unrecognized;
    };

    let flags = caps
        .name("flags")
        .map(|m| {
            m.as_str()
                .split_whitespace()
                .map(|flag| flag.trim_start_matches('\\').to_string())
                .collect()
        })
        .unwrap_or_default();

    let record = LogRecord {
        account: account.as_str().to_lowercase(),
        mailbox: caps["box"].trim().to_string(),
        uid,
        message_id: caps["msgid"].to_string(),
        flags,
    };

    if let Some(from) = caps.name("from") {
        return LogEvent::Move {
            from: from.as_str().trim().to_string(),
            record,
        };
    }
    if &caps["kind"] == "expunge" && record.has_flag("Deleted") {
        return LogEvent::Delete(record);
    }
    LogEvent::FlagChange(record)
}

/// Parse the syslog-style `Mmm dd hh:mm:ss` prefix of a line.
///
/// The year is taken from `reference`; a timestamp that would land more than a
/// day after `reference` belongs to the previous year.
pub fn parse_log_timestamp(line: &str, reference: DateTime<Local>) -> Option<DateTime<Utc>> {
    let mut tokens = line.split_whitespace();
    let month: Month = tokens.next()?.parse().ok()?;
    let day: u32 = tokens.next()?.parse().ok()?;
    let time = NaiveTime::parse_from_str(tokens.next()?, "%H:%M:%S").ok()?;

    let resolve = |year: i32| -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(year, month.number_from_month(), day)?;
        let local = Local.from_local_datetime(&NaiveDateTime::new(date, time)).earliest()?;
        Some(local.with_timezone(&Utc))
    };

    let stamp = resolve(reference.year())?;
    if stamp > reference.with_timezone(&Utc) + chrono::Duration::days(1) {
        return resolve(reference.year() - 1);
    }
    Some(stamp)
}
