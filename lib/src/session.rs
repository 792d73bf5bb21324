use std::net::SocketAddr;
use mio::Token;
use time::{Duration,SteadyTime};
use uuid::Uuid;
use uuid::adapter::Hyphenated;
use chrono::{DateTime,Local};

use SessionState;
use command_queue::{CommandKind,CommandQueue,PendingCommand};
use protocol;
use protocol::Patterns;
use socket::TextStream;

#[derive(Debug,PartialEq,Eq)]
pub enum ClientAction {
  /// the line was forwarded or swallowed, nothing else to do
  Handled,
  /// the client asked for the socket table, the server must answer
  StatusReport,
}

/// one client connection and its shadow on the backend
///
/// The session owns both sockets. The client side lives as long as the
/// session; the world side can be opened, lost and reopened many times while
/// the client never notices.
pub struct Session {
  pub session_id:        u32,
  pub client:            TextStream,
  pub backend:           Option<TextStream>,
  pub user:              Option<String>,
  pub password:          Option<String>,
  pub created_at:        SteadyTime,
  pub created_wall:      DateTime<Local>,
  /// set the instant the world socket dropped unexpectedly, cleared on
  /// reconnect or once the disconnect is confirmed intentional
  pub disconnect_at:     Option<SteadyTime>,
  /// world side absent or not yet past the reconnect sentinel: backend
  /// output must not reach the client
  pub reconnect_pending: bool,
  /// absorbs one spurious client-side close per failover cycle
  pub was_offline:       bool,
  /// the offline notice for the current outage episode was already written
  pub notified_offline:  bool,
  pub remote_host:       String,
  pub queue:             CommandQueue,
  pub request_id:        Hyphenated,
  log_ctx:               String,
}

impl Session {
  pub fn new(session_id: u32, client: TextStream, peer: SocketAddr) -> Session {
    let request_id = Uuid::new_v4().to_hyphenated();
    let log_ctx    = format!("{}\tunconnected\t", request_id);
    Session {
      session_id,
      client,
      backend:           None,
      user:              None,
      password:          None,
      created_at:        SteadyTime::now(),
      created_wall:      Local::now(),
      disconnect_at:     None,
      reconnect_pending: false,
      was_offline:       false,
      notified_offline:  false,
      remote_host:       peer.ip().to_string(),
      queue:             CommandQueue::new(),
      request_id,
      log_ctx,
    }
  }

  pub fn log_ctx(&self) -> &str {
    &self.log_ctx
  }

  pub fn state(&self) -> SessionState {
    if !self.reconnect_pending {
      SessionState::Proxying
    } else if self.backend.is_some() {
      SessionState::Reconnecting
    } else {
      SessionState::BackendLost
    }
  }

  pub fn authenticated(&self) -> bool {
    self.user.is_some()
  }

  pub fn credentials(&self) -> Option<(String, String)> {
    match (self.user.as_ref(), self.password.as_ref()) {
      (Some(user), Some(password)) => Some((user.clone(), password.clone())),
      _ => None,
    }
  }

  pub fn set_credentials(&mut self, user: String, password: String) {
    self.log_ctx  = format!("{}\t{}\t", self.request_id, user);
    self.user     = Some(user);
    self.password = Some(password);
  }

  pub fn client_token(&self) -> Token {
    self.client.token
  }

  pub fn backend_token(&self) -> Option<Token> {
    self.backend.as_ref().map(|world| world.token)
  }

  pub fn attach_backend(&mut self, world: TextStream) {
    self.backend = Some(world);
  }

  pub fn detach_backend(&mut self) -> Option<TextStream> {
    self.backend.take()
  }

  /// one line from the client, already stripped of its terminator
  pub fn handle_client_line(&mut self, line: &str, now: SteadyTime) -> ClientAction {
    if protocol::is_status_command(line) {
      return ClientAction::StatusReport;
    }

    if let Some((user, password)) = protocol::parse_connect(line) {
      debug!("{}queueing login attempt for {}", self.log_ctx, user);
      self.queue.push(PendingCommand {
        kind:       CommandKind::Connect,
        user,
        password,
        created_at: now,
      });
    }

    match self.backend {
      Some(ref mut world) => world.write_line(line),
      None => debug!("{}no world socket, dropping client line", self.log_ctx),
    }
    ClientAction::Handled
  }

  /// one line from the world socket
  pub fn handle_backend_line(&mut self, line: &str, patterns: &Patterns, online_notice: &str) {
    if self.reconnect_pending {
      if protocol::is_reconnect_sentinel(line) {
        info!("{}reconnect complete", self.log_ctx);
        self.client.write_raw(online_notice);
        self.reconnect_pending = false;
        self.notified_offline = false;
      } else {
        trace!("{}gagged while reconnecting: {:?}", self.log_ctx, line);
      }
      return;
    }

    self.correlate_auth(line, patterns);
    self.client.write_line(line);
  }

  /// match backend output against the head of the pending queue
  fn correlate_auth(&mut self, line: &str, patterns: &Patterns) {
    if self.queue.peek_kind() != Some(CommandKind::Connect) {
      return;
    }
    if patterns.connect_success.is_match(line) {
      if let Some(entry) = self.queue.pop() {
        info!("{}logged in as {} from {}", self.log_ctx, entry.user, self.remote_host);
        self.set_credentials(entry.user, entry.password);
      }
    } else if patterns.connect_fail.is_match(line) {
      if let Some(entry) = self.queue.pop() {
        debug!("{}login failed for {}", self.log_ctx, entry.user);
      }
    }
  }

  /// drop login attempts that never got an answer
  pub fn expire_pending(&mut self, now: SteadyTime, timeout: Duration) {
    let dropped = self.queue.drop_expired(now, timeout);
    if dropped > 0 {
      debug!("{}dropped {} unconfirmed login attempt(s)", self.log_ctx, dropped);
    }
  }
}
