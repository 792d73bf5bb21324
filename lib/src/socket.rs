use std::io::{self,ErrorKind,Read,Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use mio::{Poll,PollOpt,Ready,Token};
use mio::net::{TcpListener,TcpStream};
use mio::unix::UnixReady;
use net2::TcpBuilder;
use net2::unix::UnixTcpBuilderExt;

use buffer::LineBuffer;

#[derive(Debug,PartialEq,Copy,Clone)]
pub enum SocketResult {
  Continue,
  Closed,
  WouldBlock,
  Error
}

fn socket_read(socket: &mut TcpStream, buf: &mut [u8]) -> (usize, SocketResult) {
  let mut size = 0usize;
  loop {
    if size == buf.len() {
      return (size, SocketResult::Continue);
    }
    match socket.read(&mut buf[size..]) {
      Ok(0)  => return (size, SocketResult::Continue),
      Ok(sz) => size += sz,
      Err(e) => match e.kind() {
        ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionRefused => {
          return (size, SocketResult::Closed)
        },
        _ => {
          error!("SOCKET\tsocket_read error={:?}", e);
          return (size, SocketResult::Error)
        },
      }
    }
  }
}

fn socket_write(socket: &mut TcpStream, buf: &[u8]) -> (usize, SocketResult) {
  let mut size = 0usize;
  loop {
    if size == buf.len() {
      return (size, SocketResult::Continue);
    }
    match socket.write(&buf[size..]) {
      Ok(0)  => return (size, SocketResult::Continue),
      Ok(sz) => size += sz,
      Err(e) => match e.kind() {
        ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionRefused => {
          return (size, SocketResult::Closed)
        },
        _ => {
          error!("SOCKET\tsocket_write error={:?}", e);
          return (size, SocketResult::Error)
        },
      }
    }
  }
}

/// a registered stream socket carrying line-oriented text
///
/// Input bytes are framed into lines by a `LineBuffer`; output is queued and
/// flushed opportunistically, with writable interest registered only while
/// something is pending. Writes to a peer that went away are dropped, the
/// owner notices the loss through its own read path.
pub struct TextStream {
  pub socket: TcpStream,
  pub token:  Token,
  input:      LineBuffer,
  output:     Vec<u8>,
  write_registered: bool,
}

impl TextStream {
  pub fn new(socket: TcpStream, token: Token) -> TextStream {
    TextStream {
      socket,
      token,
      input:  LineBuffer::new(),
      output: Vec::new(),
      write_registered: false,
    }
  }

  fn interest(&self) -> Ready {
    let mut interest = UnixReady::from(Ready::readable()) | UnixReady::hup() | UnixReady::error();
    if !self.output.is_empty() {
      interest.insert(Ready::writable());
    }
    Ready::from(interest)
  }

  pub fn register(&mut self, poll: &mut Poll) -> io::Result<()> {
    self.write_registered = !self.output.is_empty();
    poll.register(&self.socket, self.token, self.interest(), PollOpt::level())
  }

  pub fn deregister(&self, poll: &mut Poll) -> io::Result<()> {
    poll.deregister(&self.socket)
  }

  /// reconcile writable interest with the state of the output queue
  pub fn update_interest(&mut self, poll: &mut Poll) -> io::Result<()> {
    let wants_write = !self.output.is_empty();
    if wants_write == self.write_registered {
      return Ok(());
    }
    poll.reregister(&self.socket, self.token, self.interest(), PollOpt::level())?;
    self.write_registered = wants_write;
    Ok(())
  }

  /// drain the socket and return the complete lines received, plus the
  /// stream status: `Continue` while the peer is still there
  pub fn read_lines(&mut self) -> (Vec<String>, SocketResult) {
    let mut chunk  = [0u8; 4096];
    let mut status = SocketResult::Continue;
    loop {
      let (sz, res) = socket_read(&mut self.socket, &mut chunk);
      if sz > 0 {
        self.input.extend(&chunk[..sz]);
      }
      match res {
        SocketResult::WouldBlock => break,
        SocketResult::Closed | SocketResult::Error => {
          status = res;
          break;
        },
        SocketResult::Continue => {
          // a short read with no error is EOF, a full chunk means more may follow
          if sz < chunk.len() {
            status = SocketResult::Closed;
            break;
          }
        },
      }
    }

    let mut lines = Vec::new();
    while let Some(line) = self.input.next_line() {
      lines.push(line);
    }
    (lines, status)
  }

  /// queue a line, terminator appended, and flush what the socket accepts
  pub fn write_line(&mut self, line: &str) {
    self.output.extend_from_slice(line.as_bytes());
    self.output.push(b'\n');
    self.flush();
  }

  /// queue raw text (multi-line notices) without touching terminators
  pub fn write_raw(&mut self, data: &str) {
    self.output.extend_from_slice(data.as_bytes());
    self.flush();
  }

  pub fn flush(&mut self) -> SocketResult {
    if self.output.is_empty() {
      return SocketResult::Continue;
    }
    let (sz, res) = socket_write(&mut self.socket, &self.output);
    if sz > 0 {
      self.output.drain(..sz);
    }
    match res {
      SocketResult::Closed | SocketResult::Error => {
        // peer is gone, the read path will report it
        self.output.clear();
      },
      _ => {},
    }
    res
  }

  pub fn wants_write(&self) -> bool {
    !self.output.is_empty()
  }
}

pub fn server_bind(addr: &SocketAddr) -> io::Result<TcpListener> {
  let sock = match *addr {
    SocketAddr::V4(..) => TcpBuilder::new_v4()?,
    SocketAddr::V6(..) => TcpBuilder::new_v6()?,
  };

  // set so_reuseaddr, but only on unix (mirrors what libstd does)
  if cfg!(unix) {
    sock.reuse_address(true)?;
  }

  sock.reuse_port(true)?;

  sock.bind(addr)?;

  let listener = sock.listen(1024)?;
  TcpListener::from_std(listener)
}

pub fn server_unbind(listener: &TcpListener) -> io::Result<()> {
  match unsafe { libc::close(listener.as_raw_fd()) } {
    0 => Ok(()),
    _ => Err(io::Error::last_os_error())
  }
}
