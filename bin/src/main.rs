//! holdfast daemon entry point: parse arguments, load the configuration,
//! install signal handlers and hand control to the event loop.

#[macro_use] extern crate log;
extern crate env_logger;
extern crate clap;
extern crate libc;
extern crate nix;
extern crate holdfast_command_lib as holdfast_command;
extern crate holdfast_lib as holdfast;

use std::process;
use std::sync::atomic::{AtomicBool,Ordering};
use clap::{App,Arg};
use nix::sys::signal::{sigaction,SaFlags,SigAction,SigHandler,SigSet,Signal};

use holdfast_command::config::Config;
use holdfast::server::Server;

static RELOAD:   AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sighup(_: libc::c_int) {
  RELOAD.store(true, Ordering::SeqCst);
}

extern "C" fn handle_shutdown(_: libc::c_int) {
  SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), nix::Error> {
  let reload = SigAction::new(SigHandler::Handler(handle_sighup),
    SaFlags::empty(), SigSet::empty());
  let shutdown = SigAction::new(SigHandler::Handler(handle_shutdown),
    SaFlags::empty(), SigSet::empty());
  unsafe {
    sigaction(Signal::SIGHUP, &reload)?;
    sigaction(Signal::SIGINT, &shutdown)?;
    sigaction(Signal::SIGTERM, &shutdown)?;
  }
  Ok(())
}

fn load_config(path: Option<&str>) -> Config {
  match path {
    Some(path) => match Config::load_from_path(path) {
      Ok(config) => config,
      Err(e) => {
        error!("MAIN\tcould not load configuration from {}: {}", path, e);
        process::exit(1);
      },
    },
    None => {
      warn!("MAIN\tno configuration file given, using defaults");
      Config::default()
    },
  }
}

fn main() {
  env_logger::init();

  let matches = App::new("holdfast")
    .version("0.1.0")
    .about("keeps MUSH client sessions alive across backend restarts")
    .arg(Arg::with_name("config")
      .short("c")
      .long("config")
      .value_name("FILE")
      .help("path to the TOML configuration file")
      .takes_value(true))
    .get_matches();

  let config_path = matches.value_of("config").map(String::from);
  let config = load_config(config_path.as_ref().map(|path| path.as_str()));

  let mut server = match Server::new(config) {
    Ok(server) => server,
    Err(e) => {
      error!("MAIN\tcould not start: {}", e);
      process::exit(1);
    },
  };

  if let Err(e) = install_signal_handlers() {
    error!("MAIN\tcould not install signal handlers: {}", e);
    process::exit(1);
  }

  info!("MAIN\tholdfast started");
  while !SHUTDOWN.load(Ordering::SeqCst) {
    server.run_once();
    if RELOAD.swap(false, Ordering::SeqCst) {
      // SIGHUP: re-read the configuration; a changed backend address makes
      // the server fail over so sessions migrate on reconnect
      match config_path {
        Some(ref path) => match Config::load_from_path(path) {
          Ok(config) => {
            info!("MAIN\treloading configuration from {}", path);
            server.reload_config(config);
          },
          Err(e) => error!("MAIN\tkeeping old configuration, reload failed: {}", e),
        },
        None => warn!("MAIN\tno configuration file to reload"),
      }
    }
  }
  info!("MAIN\tshutting down");
}
