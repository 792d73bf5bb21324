use std::io;
use std::net::SocketAddr;
use mio::{Poll,Token};
use mio::net::TcpStream;
use time::{Duration,SteadyTime};

use socket::{SocketResult,TextStream};

/// the liveness oracle for the backend
///
/// A single dedicated connection, logged in with its own credentials, whose
/// presence defines `online()`. While it is up, any line it produces proves
/// the backend is reachable; when it dies, every session is assumed cut off.
/// Reopening is attempted at most once per interval.
pub struct HeartbeatController {
  address:      SocketAddr,
  interval:     Duration,
  user:         String,
  password:     String,
  stream:       Option<TextStream>,
  next_attempt: SteadyTime,
  /// whether the current outage was already reported in the logs
  announced_offline: bool,
}

impl HeartbeatController {
  pub fn new(address: SocketAddr, interval_secs: u64, user: &str, password: &str) -> HeartbeatController {
    HeartbeatController {
      address,
      interval:     Duration::seconds(interval_secs as i64),
      user:         user.to_string(),
      password:     password.to_string(),
      stream:       None,
      next_attempt: SteadyTime::now(),
      announced_offline: false,
    }
  }

  /// the backend counts as online exactly while the heartbeat socket exists
  pub fn online(&self) -> bool {
    self.stream.is_some()
  }

  pub fn token(&self) -> Option<Token> {
    self.stream.as_ref().map(|stream| stream.token)
  }

  pub fn should_attempt(&self, now: SteadyTime) -> bool {
    self.stream.is_none() && now >= self.next_attempt
  }

  /// open the heartbeat connection and send its login
  ///
  /// The token must already be reserved by the caller; on error the caller
  /// frees it again. Whatever the outcome, the next attempt is pushed one
  /// interval out.
  pub fn try_open(&mut self, poll: &mut Poll, token: Token, now: SteadyTime) -> io::Result<()> {
    self.next_attempt = now + self.interval;
    let socket = TcpStream::connect(&self.address)?;
    let mut stream = TextStream::new(socket, token);
    stream.register(poll)?;
    info!("HB\topening heartbeat connection to {} [{:?}]", self.address, token);
    stream.write_line(&format!("connect {} {}", self.user, self.password));
    self.stream = Some(stream);
    self.announced_offline = false;
    Ok(())
  }

  pub fn connect_failed(&mut self, error: &io::Error) {
    if self.announced_offline {
      debug!("HB\tbackend still unreachable: {:?}", error);
    } else {
      error!("HB\tbackend unreachable at {}: {:?}", self.address, error);
      self.announced_offline = true;
    }
  }

  /// close the heartbeat; returns the token the caller must release
  pub fn close(&mut self, poll: &mut Poll) -> Option<Token> {
    self.stream.take().map(|stream| {
      let _ = stream.deregister(poll);
      stream.token
    })
  }

  pub fn read_lines(&mut self) -> (Vec<String>, SocketResult) {
    match self.stream {
      Some(ref mut stream) => stream.read_lines(),
      None => (Vec::new(), SocketResult::Closed),
    }
  }

  /// probes and other traffic towards the backend; dropped while offline
  pub fn write_line(&mut self, line: &str) {
    match self.stream {
      Some(ref mut stream) => stream.write_line(line),
      None => debug!("HB\toffline, dropping line {:?}", line),
    }
  }

  pub fn flush(&mut self) {
    if let Some(ref mut stream) = self.stream {
      stream.flush();
    }
  }

  pub fn update_interest(&mut self, poll: &mut Poll) {
    if let Some(ref mut stream) = self.stream {
      if let Err(e) = stream.update_interest(poll) {
        debug!("HB\tcould not update interest: {:?}", e);
      }
    }
  }

  pub fn reconfigure(&mut self, address: SocketAddr, interval_secs: u64, user: &str, password: &str) {
    self.address  = address;
    self.interval = Duration::seconds(interval_secs as i64);
    self.user     = user.to_string();
    self.password = password.to_string();
  }
}
