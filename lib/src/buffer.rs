//! per-socket line framing
//!
//! Bytes arrive from the kernel in arbitrary chunks; each socket accumulates
//! them here and hands out complete lines in reception order. A line ends at
//! LF, an optional CR right before it is stripped with it. A lone CR is not a
//! terminator and stays buffered with the rest of a partial line.

#[derive(Debug)]
pub struct LineBuffer {
  buf: Vec<u8>,
}

impl LineBuffer {
  pub fn new() -> LineBuffer {
    LineBuffer { buf: Vec::new() }
  }

  pub fn extend(&mut self, data: &[u8]) {
    self.buf.extend_from_slice(data);
  }

  /// next complete line, without its terminator
  pub fn next_line(&mut self) -> Option<String> {
    let pos = self.buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
  }

  /// bytes of a partial trailing line still waiting for a terminator
  pub fn pending(&self) -> usize {
    self.buf.len()
  }
}
