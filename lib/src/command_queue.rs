//! pending commands awaiting backend confirmation
//!
//! When a client sends a login, the proxy cannot tell from the command alone
//! whether it will succeed; the answer arrives later as an ordinary backend
//! line. Each session keeps a FIFO of in-flight commands, and the head entry
//! is the one the next matching backend line is correlated with. Entries that
//! never get an answer are dropped after a timeout.

use std::collections::VecDeque;
use time::{Duration,SteadyTime};

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum CommandKind {
  Connect,
}

#[derive(Debug,Clone)]
pub struct PendingCommand {
  pub kind:       CommandKind,
  pub user:       String,
  pub password:   String,
  pub created_at: SteadyTime,
}

#[derive(Debug)]
pub struct CommandQueue {
  entries: VecDeque<PendingCommand>,
}

impl CommandQueue {
  pub fn new() -> CommandQueue {
    CommandQueue { entries: VecDeque::new() }
  }

  pub fn push(&mut self, entry: PendingCommand) {
    self.entries.push_back(entry);
  }

  pub fn peek_kind(&self) -> Option<CommandKind> {
    self.entries.front().map(|entry| entry.kind)
  }

  pub fn pop(&mut self) -> Option<PendingCommand> {
    self.entries.pop_front()
  }

  pub fn head_age(&self, now: SteadyTime) -> Option<Duration> {
    self.entries.front().map(|entry| now - entry.created_at)
  }

  /// drop entries that waited at least `timeout` for a confirmation
  pub fn drop_expired(&mut self, now: SteadyTime, timeout: Duration) -> usize {
    let mut dropped = 0;
    while let Some(age) = self.head_age(now) {
      if age < timeout {
        break;
      }
      self.entries.pop_front();
      dropped += 1;
    }
    dropped
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
