//! the in-band text protocol
//!
//! Everything holdfast reads into or writes onto the line stream is matched
//! or built here: the `connect` login command it captures for replay, the
//! configurable login success/failure patterns, and the two sentinel tokens
//! riding on `think` commands. The sentinels are a fragile in-band protocol
//! kept for backend compatibility, which is why their matching lives in one
//! place only.

use regex;
use regex::Regex;

/// echoed back by the backend to close the reconnect gag
pub const RECONNECT_SENTINEL: &'static str = "### RECONNECT COMPLETE ###";
/// prefix of the liveness probe sent on the heartbeat connection
pub const PING_PREFIX: &'static str = "### PING: ";
/// introspection request, recognized on a line of its own
pub const STATUS_COMMAND: &'static str = "#?";

/// probe line for the heartbeat: the backend echoes `think` output back to
/// the connection that sent it, so any answer proves the backend is alive
pub fn probe_line(session_id: u32) -> String {
  format!("think {}{}###", PING_PREFIX, session_id)
}

/// barrier sent right after a replayed login; its echo ends the gag
pub fn reconnect_barrier() -> String {
  format!("think {}", RECONNECT_SENTINEL)
}

pub fn is_reconnect_sentinel(line: &str) -> bool {
  line.contains(RECONNECT_SENTINEL)
}

pub fn is_status_command(line: &str) -> bool {
  line.trim() == STATUS_COMMAND
}

/// recognize `connect <user> <password>`, case-insensitive on the verb
///
/// Tokens may not contain `;`, `,`, `%` or whitespace; anything else on the
/// line means it is not a plain login and is left alone.
pub fn parse_connect(line: &str) -> Option<(String, String)> {
  let trimmed = line.trim_start();
  let verb = trimmed.get(..7)?;
  if !verb.eq_ignore_ascii_case("connect") {
    return None;
  }
  let rest = &trimmed[7..];
  if !rest.starts_with(|c: char| c.is_whitespace()) {
    return None;
  }
  let mut tokens = rest.split_whitespace();
  let user     = tokens.next()?;
  let password = tokens.next()?;
  if tokens.next().is_some() {
    return None;
  }
  if !valid_token(user) || !valid_token(password) {
    return None;
  }
  Some((user.to_string(), password.to_string()))
}

fn valid_token(token: &str) -> bool {
  !token.is_empty() && !token.chars().any(|c| c == ';' || c == ',' || c == '%')
}

/// compiled login confirmation patterns
pub struct Patterns {
  pub connect_success: Regex,
  pub connect_fail:    Regex,
}

impl Patterns {
  pub fn new(connect_success: &str, connect_fail: &str) -> Result<Patterns, regex::Error> {
    Ok(Patterns {
      connect_success: Regex::new(connect_success)?,
      connect_fail:    Regex::new(connect_fail)?,
    })
  }
}
