use std::io::{self,ErrorKind};
use std::net::{SocketAddr,ToSocketAddrs};
use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration as StdDuration;
use mio::{Events,Poll,PollOpt,Ready,Token};
use mio::net::{TcpListener,TcpStream};
use mio::unix::UnixReady;
use slab::Slab;
use time::{Duration,SteadyTime};

use holdfast_command::config::Config;
use heartbeat::HeartbeatController;
use protocol;
use protocol::Patterns;
use session::{ClientAction,Session};
use socket::{server_bind,SocketResult,TextStream};

/// what a live token points at
#[derive(Clone)]
pub enum SocketOwner {
  Listener,
  Heartbeat,
  Client(Rc<RefCell<Session>>),
  World(Rc<RefCell<Session>>),
}

/// the proxy event loop
///
/// One iteration: maybe reopen the heartbeat, sweep stale sessions, poll for
/// one second, dispatch whatever is ready. Every socket lives in the slab
/// under its token; a session's client and world tokens both resolve to the
/// same shared session, so lookups from either side are O(1).
pub struct Server {
  poll:            Poll,
  config:          Config,
  patterns:        Patterns,
  listener:        TcpListener,
  sockets:         Slab<SocketOwner>,
  heartbeat:       HeartbeatController,
  backend_address: SocketAddr,
  next_session_id: u32,
}

fn resolve_backend(address: &str) -> io::Result<SocketAddr> {
  address.to_socket_addrs()?
    .next()
    .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable,
      format!("could not resolve backend address {}", address)))
}

impl Server {
  pub fn new(config: Config) -> io::Result<Server> {
    let patterns = Patterns::new(&config.connect_success, &config.connect_fail)
      .map_err(|e| io::Error::new(ErrorKind::InvalidInput,
        format!("invalid login pattern: {}", e)))?;
    let backend_address = resolve_backend(&config.mush_address)?;
    let listen_address: SocketAddr = format!("0.0.0.0:{}", config.local_port).parse()
      .map_err(|e| io::Error::new(ErrorKind::InvalidInput,
        format!("invalid listen address: {}", e)))?;
    let listener = server_bind(&listen_address)?;
    let poll = Poll::new()?;

    let mut sockets = Slab::with_capacity(1024);
    let listen_token = Token(sockets.insert(SocketOwner::Listener));
    poll.register(&listener, listen_token, Ready::readable(), PollOpt::level())?;

    let heartbeat = HeartbeatController::new(backend_address, config.heartbeat_interval,
      &config.heartbeat_user, &config.heartbeat_password);

    info!("SERVER\tlistening on {}, proxying for {}",
      listener.local_addr()?, config.mush_address);

    Ok(Server {
      poll,
      config,
      patterns,
      listener,
      sockets,
      heartbeat,
      backend_address,
      next_session_id: 1,
    })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub fn session_count(&self) -> usize {
    self.sockets.iter().filter(|&(_, owner)| {
      match *owner {
        SocketOwner::Client(_) => true,
        _ => false,
      }
    }).count()
  }

  pub fn run(&mut self) {
    loop {
      self.run_once();
    }
  }

  /// one iteration of the event loop; errors are logged, never propagated,
  /// so a fault in one session cannot take the others down
  pub fn run_once(&mut self) {
    let now = SteadyTime::now();
    self.heartbeat_maybe_open(now);
    self.cleanup_stale_sessions(now);

    let mut events = Events::with_capacity(1024);
    if let Err(e) = self.poll.poll(&mut events, Some(StdDuration::from_secs(1))) {
      error!("SERVER\tpoll error: {:?}", e);
      return;
    }

    let ready: Vec<(Token, Ready)> = events.iter()
      .map(|event| (event.token(), event.readiness()))
      .collect();
    for (token, readiness) in ready {
      self.dispatch(token, readiness);
    }

    self.flush_pending();
  }

  fn dispatch(&mut self, token: Token, readiness: Ready) {
    let owner = match self.sockets.get(token.0) {
      Some(owner) => owner.clone(),
      None => {
        trace!("SERVER\tevent for stale token {:?}", token);
        return;
      },
    };
    match owner {
      SocketOwner::Listener        => self.accept_sessions(),
      SocketOwner::Heartbeat       => self.heartbeat_event(token, readiness),
      SocketOwner::Client(session) => self.client_event(session, readiness),
      SocketOwner::World(session)  => self.world_event(session, token, readiness),
    }
  }

  fn accept_sessions(&mut self) {
    loop {
      match self.listener.accept() {
        Ok((socket, peer)) => {
          if let Err(e) = self.create_session(socket, peer) {
            error!("SERVER\tcould not create session for {}: {:?}", peer, e);
          }
        },
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
        Err(e) => {
          error!("SERVER\taccept() IO error: {:?}", e);
          break;
        },
      }
    }
  }

  fn create_session(&mut self, socket: TcpStream, peer: SocketAddr) -> io::Result<()> {
    let entry = self.sockets.vacant_entry();
    let token = Token(entry.key());
    let mut client = TextStream::new(socket, token);
    client.register(&mut self.poll)?;

    let session_id = self.next_session_id;
    self.next_session_id += 1;
    let session = Rc::new(RefCell::new(Session::new(session_id, client, peer)));
    info!("{}accepted client from {} [{:?}]", session.borrow().log_ctx(), peer, token);
    entry.insert(SocketOwner::Client(session.clone()));

    self.connect_backend(&session, false);
    Ok(())
  }

  /// open (or reopen) the world side of a session
  ///
  /// `was_offline` marks the reconnect path: the stored login is replayed,
  /// followed by the sentinel barrier that will end the gag. A held session
  /// with nothing to replay cannot be resumed and is dropped instead.
  fn connect_backend(&mut self, session: &Rc<RefCell<Session>>, was_offline: bool) {
    if was_offline && !session.borrow().authenticated() {
      info!("{}no credentials to replay, dropping held session",
        session.borrow().log_ctx());
      self.destroy_session(session);
      return;
    }
    if !self.heartbeat.online() {
      debug!("{}backend offline, not opening a world connection",
        session.borrow().log_ctx());
      return;
    }
    if session.borrow().backend.is_some() {
      return;
    }

    let socket = match TcpStream::connect(&self.backend_address) {
      Ok(socket) => socket,
      Err(e) => {
        error!("{}could not open world connection to {}: {:?}",
          session.borrow().log_ctx(), self.backend_address, e);
        return;
      },
    };

    let entry = self.sockets.vacant_entry();
    let token = Token(entry.key());
    let mut world = TextStream::new(socket, token);
    if let Err(e) = world.register(&mut self.poll) {
      error!("{}could not register world socket: {:?}",
        session.borrow().log_ctx(), e);
      return;
    }
    entry.insert(SocketOwner::World(session.clone()));

    let mut s = session.borrow_mut();
    if !self.config.remotehostname_cmd.is_empty() {
      world.write_line(&format!("{} {}", self.config.remotehostname_cmd, s.remote_host));
    }
    debug!("{}world connection to {} [{:?}]", s.log_ctx(), self.backend_address, token);
    s.attach_backend(world);

    if was_offline {
      s.disconnect_at = None;
      if let Some((user, password)) = s.credentials() {
        info!("{}replaying login on the new world connection", s.log_ctx());
        if let Some(ref mut world) = s.backend {
          world.write_line(&format!("connect {} {}", user, password));
          world.write_line(&protocol::reconnect_barrier());
        }
      }
    }
  }

  fn detach_backend(&mut self, session: &Rc<RefCell<Session>>) {
    let world = session.borrow_mut().detach_backend();
    if let Some(world) = world {
      let _ = world.deregister(&mut self.poll);
      if self.sockets.contains(world.token.0) {
        self.sockets.remove(world.token.0);
      }
    }
  }

  fn destroy_session(&mut self, session: &Rc<RefCell<Session>>) {
    let client_token = session.borrow().client_token();
    // a session can be named twice in one event batch, only tear down once
    match self.sockets.get(client_token.0) {
      Some(&SocketOwner::Client(ref registered)) if Rc::ptr_eq(registered, session) => {},
      _ => return,
    }
    self.detach_backend(session);
    {
      let s = session.borrow();
      info!("{}closing session from {}", s.log_ctx(), s.remote_host);
      let _ = s.client.deregister(&mut self.poll);
    }
    self.sockets.remove(client_token.0);
  }

  fn client_event(&mut self, session: Rc<RefCell<Session>>, readiness: Ready) {
    let readiness = UnixReady::from(readiness);
    if readiness.is_writable() {
      session.borrow_mut().client.flush();
    }
    if !readiness.is_readable() && !readiness.is_hup() && !readiness.is_error() {
      return;
    }

    let (lines, status) = session.borrow_mut().client.read_lines();
    let now = SteadyTime::now();
    for line in lines {
      let action = session.borrow_mut().handle_client_line(&line, now);
      if action == ClientAction::StatusReport {
        self.send_status_report(&session);
      }
    }
    if status == SocketResult::Closed || status == SocketResult::Error {
      self.client_eof(&session);
    }
  }

  fn client_eof(&mut self, session: &Rc<RefCell<Session>>) {
    {
      let mut s = session.borrow_mut();
      if s.was_offline {
        // the close the proxy itself provoked during failover teardown shows
        // up as one spurious EOF on the next tick; swallow exactly that one
        s.was_offline = false;
        debug!("{}suppressing one client EOF after failover", s.log_ctx());
        return;
      }
    }
    self.destroy_session(session);
  }

  fn world_event(&mut self, session: Rc<RefCell<Session>>, token: Token, readiness: Ready) {
    if session.borrow().backend_token() != Some(token) {
      trace!("SERVER\tevent for a detached world token {:?}", token);
      return;
    }
    let readiness = UnixReady::from(readiness);
    if readiness.is_writable() {
      if let Some(ref mut world) = session.borrow_mut().backend {
        world.flush();
      }
    }
    if !readiness.is_readable() && !readiness.is_hup() && !readiness.is_error() {
      return;
    }

    let (lines, status) = {
      let mut s = session.borrow_mut();
      match s.backend {
        Some(ref mut world) => world.read_lines(),
        None => return,
      }
    };
    for line in lines {
      session.borrow_mut().handle_backend_line(&line, &self.patterns,
        &self.config.online_notice);
    }
    if status == SocketResult::Closed || status == SocketResult::Error {
      self.world_eof(&session);
    }
  }

  /// the world socket died under the session
  ///
  /// While the heartbeat is up this is ambiguous: the backend may have closed
  /// this one user on purpose, or died without the heartbeat noticing yet. A
  /// probe on the heartbeat settles it: any answer proves the backend is
  /// alive and the disconnect intentional; silence beyond the probe timeout
  /// means failover. A connection that drops again before the reconnect
  /// sentinel arrived goes through the same arming, so the probe-timeout
  /// sweep can always declare failover and retry.
  fn world_eof(&mut self, session: &Rc<RefCell<Session>>) {
    self.detach_backend(session);
    let probe = {
      let mut s = session.borrow_mut();
      if s.reconnect_pending {
        debug!("{}world connection failed before the reconnect completed", s.log_ctx());
      } else {
        info!("{}world connection lost", s.log_ctx());
      }
      s.disconnect_at = Some(SteadyTime::now());
      s.reconnect_pending = true;
      if self.heartbeat.online() {
        Some(protocol::probe_line(s.session_id))
      } else {
        None
      }
    };
    if let Some(probe) = probe {
      self.heartbeat.write_line(&probe);
    }
  }

  fn heartbeat_event(&mut self, token: Token, readiness: Ready) {
    if self.heartbeat.token() != Some(token) {
      return;
    }
    let readiness = UnixReady::from(readiness);
    if readiness.is_writable() {
      self.heartbeat.flush();
    }
    if !readiness.is_readable() && !readiness.is_hup() && !readiness.is_error() {
      return;
    }

    let (lines, status) = self.heartbeat.read_lines();
    if !lines.is_empty() {
      self.heartbeat_answered(lines.len());
    }
    if status == SocketResult::Closed || status == SocketResult::Error {
      error!("HB\theartbeat connection lost, starting failover");
      self.failover_teardown();
      let now = SteadyTime::now();
      self.heartbeat_maybe_open(now);
    }
  }

  /// anything the heartbeat hears proves the backend is reachable, so every
  /// session still waiting on a probe was disconnected on purpose
  fn heartbeat_answered(&mut self, line_count: usize) {
    trace!("HB\t{} line(s) from the backend", line_count);
    let confirmed: Vec<Rc<RefCell<Session>>> = self.client_sessions().into_iter()
      .filter(|session| session.borrow().disconnect_at.is_some())
      .collect();
    for session in confirmed {
      info!("{}backend closed this session on purpose, closing the client side",
        session.borrow().log_ctx());
      self.destroy_session(&session);
    }
  }

  /// the backend is gone: close the heartbeat, strip every session of its
  /// world socket and hold the clients until the backend answers again
  fn failover_teardown(&mut self) {
    if let Some(token) = self.heartbeat.close(&mut self.poll) {
      if self.sockets.contains(token.0) {
        self.sockets.remove(token.0);
      }
    }
    for session in self.client_sessions() {
      self.detach_backend(&session);
      let mut s = session.borrow_mut();
      // one notice per outage episode; the flag clears once the reconnect
      // sentinel ends the gag
      if !s.notified_offline {
        s.client.write_raw(&self.config.offline_notice);
        s.notified_offline = true;
      }
      s.reconnect_pending = true;
      s.disconnect_at = None;
    }
  }

  fn heartbeat_maybe_open(&mut self, now: SteadyTime) {
    if !self.heartbeat.should_attempt(now) {
      return;
    }
    let entry = self.sockets.vacant_entry();
    let token = Token(entry.key());
    match self.heartbeat.try_open(&mut self.poll, token, now) {
      Ok(()) => {
        entry.insert(SocketOwner::Heartbeat);
      },
      Err(e) => {
        self.heartbeat.connect_failed(&e);
        return;
      },
    }

    // the backend is reachable again: wake every held session
    for session in self.client_sessions() {
      session.borrow_mut().was_offline = true;
      self.connect_backend(&session, true);
    }
  }

  fn cleanup_stale_sessions(&mut self, now: SteadyTime) {
    let auth_timeout   = Duration::seconds(self.config.auth_timeout as i64);
    let unauth_timeout = Duration::seconds(self.config.unauth_timeout as i64);
    let probe_timeout  = Duration::seconds(self.config.probe_timeout as i64);

    let mut doomed = Vec::new();
    let mut probe_expired = false;
    for session in self.client_sessions() {
      let mut s = session.borrow_mut();
      s.expire_pending(now, auth_timeout);
      if !s.authenticated() && now - s.created_at >= unauth_timeout {
        drop(s);
        doomed.push(session);
        continue;
      }
      if let Some(disconnect_at) = s.disconnect_at {
        if now - disconnect_at >= probe_timeout {
          probe_expired = true;
        }
      }
    }
    for session in doomed {
      info!("{}session never authenticated, closing", session.borrow().log_ctx());
      self.destroy_session(&session);
    }
    if probe_expired {
      error!("SERVER\tno heartbeat answer within the probe timeout, starting failover");
      self.failover_teardown();
    }
  }

  /// re-arm writable interest for every stream that still has output queued
  fn flush_pending(&mut self) {
    for session in self.client_sessions() {
      let mut s = session.borrow_mut();
      if let Err(e) = s.client.update_interest(&mut self.poll) {
        debug!("SERVER\tcould not update client interest: {:?}", e);
      }
      if let Some(ref mut world) = s.backend {
        if let Err(e) = world.update_interest(&mut self.poll) {
          debug!("SERVER\tcould not update world interest: {:?}", e);
        }
      }
    }
    self.heartbeat.update_interest(&mut self.poll);
  }

  fn client_sessions(&self) -> Vec<Rc<RefCell<Session>>> {
    self.sockets.iter().filter_map(|(_, owner)| {
      match *owner {
        SocketOwner::Client(ref session) => Some(session.clone()),
        _ => None,
      }
    }).collect()
  }

  fn send_status_report(&mut self, target: &Rc<RefCell<Session>>) {
    let report = self.status_report();
    let mut s = target.borrow_mut();
    for line in &report {
      s.client.write_line(line);
    }
  }

  /// the socket table behind the `#?` command, with integrity checks
  pub fn status_report(&self) -> Vec<String> {
    let mut report = Vec::new();
    report.push(format!("-- holdfast: {} tracked socket(s) --", self.sockets.len()));
    for (index, owner) in self.sockets.iter() {
      match *owner {
        SocketOwner::Listener => {
          report.push(format!("listener [{:3}] listening     -", index));
        },
        SocketOwner::Heartbeat => {
          report.push(format!("hb       [{:3}] connected     -", index));
        },
        SocketOwner::Client(ref session) => {
          let s = session.borrow();
          let user = s.user.clone().unwrap_or_else(|| String::from("unconnected"));
          report.push(format!("client   [{:3}] connected     {:<16} {:<12} since {} from {}",
            index, user, s.state().as_str(),
            s.created_wall.format("%Y-%m-%d %H:%M:%S"), s.remote_host));
          if s.client_token().0 != index {
            report.push(format!("!! client [{:3}] index entry does not match token {:?}",
              index, s.client_token()));
          }
        },
        SocketOwner::World(ref session) => {
          let s = session.borrow();
          let user = s.user.clone().unwrap_or_else(|| String::from("unconnected"));
          match s.backend_token() {
            Some(token) if token.0 == index => {
              report.push(format!("world    [{:3}] connected     {}", index, user));
            },
            other => {
              report.push(format!("!! world [{:3}] orphan entry, session points at {:?}",
                index, other));
            },
          }
        },
      }
    }
    if !self.heartbeat.online() {
      report.push(String::from("hb       [  -] not connected -"));
    }
    for session in self.client_sessions() {
      let s = session.borrow();
      if let Some(token) = s.backend_token() {
        let consistent = match self.sockets.get(token.0) {
          Some(&SocketOwner::World(ref owner)) => Rc::ptr_eq(owner, &session),
          _ => false,
        };
        if !consistent {
          report.push(format!("!! world [{:3}] missing index entry for session {}",
            token.0, s.session_id));
        }
      }
    }
    report.push(String::from("-- end of status --"));
    report
  }

  /// swap in a re-read configuration; a changed backend address forces a
  /// failover so every session migrates on its next reconnect
  pub fn reload_config(&mut self, config: Config) {
    let mut config = config;
    match Patterns::new(&config.connect_success, &config.connect_fail) {
      Ok(patterns) => self.patterns = patterns,
      Err(e) => {
        error!("SERVER\tinvalid login pattern in new configuration, keeping the old ones: {}", e);
        config.connect_success = self.config.connect_success.clone();
        config.connect_fail = self.config.connect_fail.clone();
      },
    }
    if config.local_port != self.config.local_port {
      warn!("SERVER\tlocal_port changed, this takes effect on restart only");
    }
    let mut address_changed = config.mush_address != self.config.mush_address;
    if address_changed {
      match resolve_backend(&config.mush_address) {
        Ok(address) => self.backend_address = address,
        Err(e) => {
          error!("SERVER\tcould not resolve new backend address {}: {}",
            config.mush_address, e);
          config.mush_address = self.config.mush_address.clone();
          address_changed = false;
        },
      }
    }
    self.heartbeat.reconfigure(self.backend_address, config.heartbeat_interval,
      &config.heartbeat_user, &config.heartbeat_password);
    self.config = config;
    if address_changed {
      info!("SERVER\tbackend address changed to {}, starting failover",
        self.config.mush_address);
      self.failover_teardown();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{BufRead,BufReader,Read,Write};
  use std::net;
  use std::sync::{Arc,Mutex};
  use std::sync::atomic::{AtomicBool,Ordering};
  use std::sync::mpsc;
  use std::thread;

  /// a scripted stand-in for the game server: echoes `think` arguments,
  /// confirms any login, swallows `@` commands, prompts everything else
  struct FakeBackend {
    port:   u16,
    lines:  Arc<Mutex<Vec<(usize, String)>>>,
    conns:  Arc<Mutex<Vec<net::TcpStream>>>,
    stop:   Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
  }

  fn serve_connection(socket: net::TcpStream, index: usize,
                      lines: Arc<Mutex<Vec<(usize, String)>>>) {
    let mut writer = match socket.try_clone() {
      Ok(writer) => writer,
      Err(_) => return,
    };
    let reader = BufReader::new(socket);
    for line in reader.lines() {
      let line = match line {
        Ok(line) => line,
        Err(_) => break,
      };
      lines.lock().unwrap().push((index, line.clone()));
      let reply = if line.starts_with("think ") {
        Some(line["think ".len()..].to_string())
      } else if line.to_lowercase().starts_with("connect ") {
        Some(String::from("Last connect was from 203.0.113.9."))
      } else if line.starts_with('@') {
        None
      } else {
        Some(format!("> {}", line))
      };
      if let Some(reply) = reply {
        if writer.write_all(format!("{}\r\n", reply).as_bytes()).is_err() {
          break;
        }
      }
    }
  }

  impl FakeBackend {
    fn start(port: u16) -> FakeBackend {
      let listener = net::TcpListener::bind(("127.0.0.1", port)).unwrap();
      listener.set_nonblocking(true).unwrap();
      let port = listener.local_addr().unwrap().port();
      let lines = Arc::new(Mutex::new(Vec::new()));
      let conns = Arc::new(Mutex::new(Vec::new()));
      let stop = Arc::new(AtomicBool::new(false));
      let (lines2, conns2, stop2) = (lines.clone(), conns.clone(), stop.clone());
      let handle = thread::spawn(move || {
        let mut next_index = 0usize;
        while !stop2.load(Ordering::SeqCst) {
          match listener.accept() {
            Ok((socket, _)) => {
              let index = next_index;
              next_index += 1;
              conns2.lock().unwrap().push(socket.try_clone().unwrap());
              let lines3 = lines2.clone();
              thread::spawn(move || serve_connection(socket, index, lines3));
            },
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
              thread::sleep(StdDuration::from_millis(10));
            },
            Err(_) => break,
          }
        }
      });
      FakeBackend { port, lines, conns, stop, handle: Some(handle) }
    }

    fn address(&self) -> String {
      format!("127.0.0.1:{}", self.port)
    }

    fn shutdown(&mut self) {
      self.stop.store(true, Ordering::SeqCst);
      for conn in self.conns.lock().unwrap().drain(..) {
        let _ = conn.shutdown(net::Shutdown::Both);
      }
      if let Some(handle) = self.handle.take() {
        let _ = handle.join();
      }
    }

    fn kill_connection(&self, index: usize) {
      if let Some(conn) = self.conns.lock().unwrap().get(index) {
        let _ = conn.shutdown(net::Shutdown::Both);
      }
    }

    fn received(&self) -> Vec<(usize, String)> {
      self.lines.lock().unwrap().clone()
    }

    fn connection_count(&self) -> usize {
      self.conns.lock().unwrap().len()
    }
  }

  impl Drop for FakeBackend {
    fn drop(&mut self) {
      self.shutdown();
    }
  }

  struct ProxyHandle {
    address: net::SocketAddr,
    stop:    Arc<AtomicBool>,
    handle:  Option<thread::JoinHandle<()>>,
  }

  impl ProxyHandle {
    fn connect(&self) -> net::TcpStream {
      let client = net::TcpStream::connect(self.address).unwrap();
      client.set_read_timeout(Some(StdDuration::from_secs(10))).unwrap();
      client
    }
  }

  impl Drop for ProxyHandle {
    fn drop(&mut self) {
      self.stop.store(true, Ordering::SeqCst);
      if let Some(handle) = self.handle.take() {
        let _ = handle.join();
      }
    }
  }

  fn start_proxy(config: Config) -> ProxyHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
      let mut server = Server::new(config).expect("could not start proxy");
      tx.send(server.local_addr().unwrap()).unwrap();
      while !stop2.load(Ordering::SeqCst) {
        server.run_once();
      }
    });
    let address = rx.recv().unwrap();
    ProxyHandle { address, stop, handle: Some(handle) }
  }

  fn test_config(backend_address: String) -> Config {
    let mut config = Config::default();
    config.mush_address = backend_address;
    config.local_port = 0;
    config.heartbeat_interval = 1;
    config.probe_timeout = 2;
    config
  }

  fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout_secs: i64) -> bool {
    let deadline = SteadyTime::now() + Duration::seconds(timeout_secs);
    while SteadyTime::now() < deadline {
      if condition() {
        return true;
      }
      thread::sleep(StdDuration::from_millis(50));
    }
    false
  }

  fn expect_line_containing(reader: &mut BufReader<net::TcpStream>, needle: &str) -> String {
    for _ in 0..100 {
      let mut line = String::new();
      match reader.read_line(&mut line) {
        Ok(0) => panic!("peer closed while waiting for a line containing {:?}", needle),
        Ok(_) => {
          if line.contains(needle) {
            return line.trim_end().to_string();
          }
        },
        Err(e) => panic!("read error while waiting for {:?}: {:?}", needle, e),
      }
    }
    panic!("did not receive a line containing {:?}", needle);
  }

  fn lines_for(received: &[(usize, String)], index: usize) -> Vec<String> {
    received.iter()
      .filter(|&&(conn, _)| conn == index)
      .map(|&(_, ref line)| line.clone())
      .collect()
  }

  #[test]
  fn happy_proxy_forwards_both_ways() {
    let backend = FakeBackend::start(0);
    let proxy = start_proxy(test_config(backend.address()));
    let mut client = proxy.connect();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    // heartbeat plus one world connection
    assert!(wait_until(|| backend.connection_count() >= 2, 5));

    client.write_all(b"hello\n").unwrap();
    assert_eq!(expect_line_containing(&mut reader, "> hello"), "> hello");

    let received = backend.received();
    let world_index = received.iter()
      .find(|&&(_, ref line)| line == "hello")
      .map(|&(index, _)| index)
      .expect("backend never saw the client line");
    let world_lines = lines_for(&received, world_index);
    assert_eq!(world_lines[0], "@REMOTEHOSTNAME 127.0.0.1");
    assert_eq!(world_lines[1], "hello");
  }

  #[test]
  fn login_capture_and_introspection() {
    let backend = FakeBackend::start(0);
    let proxy = start_proxy(test_config(backend.address()));

    let mut bob = proxy.connect();
    let mut bob_reader = BufReader::new(bob.try_clone().unwrap());
    let _charlie = proxy.connect();

    bob.write_all(b"connect bob hunter2\r\n").unwrap();
    // the confirmation is forwarded verbatim
    expect_line_containing(&mut bob_reader, "Last connect was from");

    bob.write_all(b"#?\n").unwrap();
    let mut report = Vec::new();
    loop {
      let line = expect_line_containing(&mut bob_reader, "");
      let done = line.contains("end of status");
      report.push(line);
      if done {
        break;
      }
    }
    assert!(report.iter().any(|line| line.contains("bob")));
    assert!(report.iter().any(|line| line.contains("unconnected")));
    assert!(report.iter().any(|line| line.starts_with("listener")));
    assert!(report.iter().any(|line| line.starts_with("hb")));
    assert!(!report.iter().any(|line| line.contains("!!")));

    // the introspection command itself never reaches the backend
    assert!(!backend.received().iter().any(|&(_, ref line)| line.contains("#?")));
  }

  #[test]
  fn backend_restart_replays_credentials() {
    let mut backend = FakeBackend::start(0);
    let port = backend.port;
    let proxy = start_proxy(test_config(backend.address()));

    let mut alice = proxy.connect();
    let mut reader = BufReader::new(alice.try_clone().unwrap());
    alice.write_all(b"connect alice secret\n").unwrap();
    expect_line_containing(&mut reader, "Last connect was from");

    backend.shutdown();
    expect_line_containing(&mut reader, "gone down");

    let backend = FakeBackend::start(port);
    expect_line_containing(&mut reader, "back up");

    let received = backend.received();
    assert!(received.iter().any(|&(_, ref line)| line == "connect alice secret"));
    assert!(received.iter().any(|&(_, ref line)| line.contains("RECONNECT COMPLETE")));

    // the session still works end to end after the failover
    alice.write_all(b"look\n").unwrap();
    expect_line_containing(&mut reader, "> look");
  }

  #[test]
  fn intentional_disconnect_closes_the_client() {
    let backend = FakeBackend::start(0);
    let proxy = start_proxy(test_config(backend.address()));

    let mut alice = proxy.connect();
    let mut reader = BufReader::new(alice.try_clone().unwrap());
    alice.write_all(b"connect alice secret\n").unwrap();
    expect_line_containing(&mut reader, "Last connect was from");

    let world_index = backend.received().iter()
      .find(|&&(_, ref line)| line == "connect alice secret")
      .map(|&(index, _)| index)
      .expect("backend never saw the login");
    backend.kill_connection(world_index);

    // the probe goes out on the heartbeat, the echo confirms the backend is
    // alive, and the proxy closes alice's side
    let mut buf = [0u8; 256];
    let deadline = SteadyTime::now() + Duration::seconds(8);
    loop {
      assert!(SteadyTime::now() < deadline, "client socket was not closed");
      match reader.get_mut().read(&mut buf) {
        Ok(0) => break,
        Ok(_) => {},
        Err(e) => panic!("unexpected read error: {:?}", e),
      }
    }
    assert!(backend.received().iter().any(|&(_, ref line)| line.contains("### PING: ")));
  }

  #[test]
  fn stale_unauthenticated_session_is_destroyed() {
    let backend = FakeBackend::start(0);
    let mut server = Server::new(test_config(backend.address())).unwrap();
    let _client = net::TcpStream::connect(server.local_addr().unwrap()).unwrap();

    for _ in 0..10 {
      server.run_once();
      if server.session_count() == 1 {
        break;
      }
    }
    assert_eq!(server.session_count(), 1);

    let now = SteadyTime::now();
    server.cleanup_stale_sessions(now + Duration::seconds(299));
    assert_eq!(server.session_count(), 1);
    server.cleanup_stale_sessions(now + Duration::seconds(301));
    assert_eq!(server.session_count(), 0);
  }

  #[test]
  fn probe_timeout_declares_failover() {
    let backend = FakeBackend::start(0);
    let mut server = Server::new(test_config(backend.address())).unwrap();
    let _client = net::TcpStream::connect(server.local_addr().unwrap()).unwrap();

    for _ in 0..10 {
      server.run_once();
      if server.session_count() == 1 && server.heartbeat.online() {
        break;
      }
    }
    let session = server.client_sessions().pop().unwrap();
    session.borrow_mut().disconnect_at = Some(SteadyTime::now());

    let now = SteadyTime::now();
    server.cleanup_stale_sessions(now + Duration::seconds(3));
    assert!(!server.heartbeat.online());
    assert!(session.borrow().reconnect_pending);
    assert!(session.borrow().disconnect_at.is_none());
  }

  #[test]
  fn offline_notice_is_single_shot() {
    let backend = FakeBackend::start(0);
    let mut server = Server::new(test_config(backend.address())).unwrap();
    let client = net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(StdDuration::from_millis(500))).unwrap();

    for _ in 0..10 {
      server.run_once();
      if server.session_count() == 1 {
        break;
      }
    }

    // repeated teardowns with no recovery in between must notify once
    server.failover_teardown();
    server.failover_teardown();
    server.failover_teardown();

    let mut client = client;
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
      match client.read(&mut buf) {
        Ok(0) => break,
        Ok(sz) => data.extend_from_slice(&buf[..sz]),
        Err(_) => break,
      }
    }
    let text = String::from_utf8_lossy(&data);
    assert_eq!(text.matches("gone down").count(), 1);
  }

  #[test]
  fn registry_indexes_stay_consistent() {
    let backend = FakeBackend::start(0);
    let mut server = Server::new(test_config(backend.address())).unwrap();
    let mut client = net::TcpStream::connect(server.local_addr().unwrap()).unwrap();

    for _ in 0..10 {
      server.run_once();
      if server.session_count() == 1 {
        break;
      }
    }
    client.write_all(b"connect alice secret\n").unwrap();
    for _ in 0..5 {
      server.run_once();
    }

    let report = server.status_report();
    assert!(report.iter().any(|line| line.starts_with("client")));
    assert!(report.iter().any(|line| line.starts_with("world")));
    assert!(!report.iter().any(|line| line.contains("!!")));

    // destroying the session must clear both index entries
    let session = server.client_sessions().pop().unwrap();
    server.destroy_session(&session);
    let report = server.status_report();
    assert!(!report.iter().any(|line| line.starts_with("client")));
    assert!(!report.iter().any(|line| line.starts_with("world")));
    assert_eq!(server.session_count(), 0);
  }
}
