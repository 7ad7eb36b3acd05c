use log::{info, warn};
use std::fs;
use std::io;
use std::path::Path;

use crate::models::ViewStateEvent;

/// Prefix of an ASP.NET 1316 event carrying a 4009 ViewState verification failure.
pub const EVENT_PREFIX: &str =
    "1316 | Information | Event code: 4009-++-Viewstate verification failed.";
pub const FIELD_SEPARATOR: &str = "-++-";

const HOSTNAME_FIELD: usize = 12;
const USERNAME_FIELD: usize = 16;
const PAGE_FIELD: usize = 18;
const SOURCE_IP_FIELD: usize = 19;
const USER_AGENT_FIELD: usize = 27;
const VIEWSTATE_FIELD: usize = 28;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    pub events: Vec<ViewStateEvent>,
    /// Lines with the event prefix but too few fields.
    pub malformed: usize,
}

pub fn parse_event_line(line: &str) -> Option<ViewStateEvent> {
    if !line.starts_with(EVENT_PREFIX) {
        return None;
    }
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() <= VIEWSTATE_FIELD {
        return None;
    }
    let field = |i: usize| Some(fields[i].to_string());
    Some(ViewStateEvent {
        hostname: field(HOSTNAME_FIELD),
        username: field(USERNAME_FIELD),
        requested_page: field(PAGE_FIELD),
        source_ip: field(SOURCE_IP_FIELD),
        user_agent: field(USER_AGENT_FIELD),
        viewstate: fields[VIEWSTATE_FIELD].trim_end().to_string(),
    })
}

pub fn parse_log(text: &str) -> ParsedLog {
    let mut parsed = ParsedLog::default();
    for (lineno, line) in text.lines().enumerate() {
        if !line.starts_with(EVENT_PREFIX) {
            continue;
        }
        match parse_event_line(line) {
            Some(event) => parsed.events.push(event),
            None => {
                warn!("Skipping truncated 4009 event on line {}", lineno + 1);
                parsed.malformed += 1;
            }
        }
    }
    parsed
}

pub fn read_log(path: &Path) -> io::Result<ParsedLog> {
    let bytes = fs::read(path)?;
    let parsed = parse_log(&String::from_utf8_lossy(&bytes));
    info!(
        "Parsed {} ViewState events from {} ({} malformed)",
        parsed.events.len(),
        path.display(),
        parsed.malformed
    );
    Ok(parsed)
}
