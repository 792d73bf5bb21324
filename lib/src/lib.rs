//! This library provides the engine of holdfast, a transparent proxy that
//! keeps MUSH-style client sessions alive across backend restarts.
//!
//! Clients connect to holdfast instead of the game server. holdfast opens one
//! backend ("world") connection per client and forwards text lines both ways
//! in a fast single threaded event loop. When the game goes down, the client
//! side of every session is kept open: holdfast probes the backend through a
//! dedicated, permanently logged in heartbeat connection, and once the game
//! answers again it reopens each world connection, replays the stored
//! `connect <user> <password>` line, and discards backend output until the
//! reconnect sentinel is echoed back. From the client's point of view the
//! session never ended.
//!
//! The heartbeat also disambiguates the ways a backend socket can die: a full
//! outage (the heartbeat dies too), an intentional disconnect of a single
//! user (the heartbeat still answers a probe), and a silent failure (the
//! probe times out and a failover teardown is declared).
//!
//! To run a proxy, build a `Config` and hand it to the server:
//!
//! ```ignore
//! extern crate env_logger;
//! extern crate holdfast_command_lib as holdfast_command;
//! extern crate holdfast_lib as holdfast;
//!
//! use holdfast_command::config::Config;
//! use holdfast::server::Server;
//!
//! fn main() {
//!   env_logger::init();
//!
//!   let config = Config {
//!     mush_address: String::from("127.0.0.1:4201"),
//!     local_port:   4000,
//!     ..Default::default()
//!   };
//!
//!   let mut server = Server::new(config).expect("could not bind listener");
//!   server.run();
//! }
//! ```
//!
//! The event loop multiplexes every socket with a one second tick; all state
//! lives on one thread and is only touched between poll returns.

#[macro_use] extern crate log;
extern crate mio;
extern crate slab;
extern crate time;
extern crate regex;
extern crate uuid;
extern crate net2;
extern crate libc;
extern crate chrono;
extern crate holdfast_command_lib as holdfast_command;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod buffer;
pub mod socket;
pub mod protocol;
pub mod command_queue;
pub mod session;
pub mod heartbeat;
pub mod server;

/// what a session is currently doing, derived from its flags
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum SessionState {
  /// both sides connected (or still unauthenticated), lines flow verbatim
  Proxying,
  /// the world connection is gone and the client is being held
  BackendLost,
  /// a world connection is open again, output is gagged until the
  /// reconnect sentinel comes back
  Reconnecting,
}

impl SessionState {
  pub fn as_str(&self) -> &'static str {
    match *self {
      SessionState::Proxying     => "proxying",
      SessionState::BackendLost  => "holding",
      SessionState::Reconnecting => "reconnecting",
    }
  }
}
