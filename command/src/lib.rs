//! This library holds the configuration surface of the holdfast proxy.
//!
//! The proxy engine in `holdfast-lib` consumes a fully resolved [`config::Config`]
//! struct; this crate owns the TOML file format, the defaults, and the
//! resolution from a partial file to a complete configuration.

extern crate serde;
#[macro_use] extern crate serde_derive;
#[macro_use] extern crate log;
extern crate toml;

pub mod config;
