//! holdfast configuration
//!
//! The file format is TOML with every key optional; missing keys fall back to
//! the defaults below. `FileConfig` is the raw deserialized form, `Config` is
//! the resolved form handed to the proxy.

use std::fs::File;
use std::io::{self,ErrorKind,Read};
use toml;

pub const DEFAULT_MUSH_ADDRESS:      &'static str = "127.0.0.1:4201";
pub const DEFAULT_LOCAL_PORT:        u16          = 4000;
pub const DEFAULT_HEARTBEAT_INTERVAL: u64         = 10;
pub const DEFAULT_AUTH_TIMEOUT:      u64          = 4;
pub const DEFAULT_UNAUTH_TIMEOUT:    u64          = 300;
pub const DEFAULT_PROBE_TIMEOUT:     u64          = 10;

pub const DEFAULT_CONNECT_SUCCESS: &'static str = "Last connect was from.*";
pub const DEFAULT_CONNECT_FAIL:    &'static str = "Either that player .*not exist.*";
pub const DEFAULT_REMOTEHOSTNAME_CMD: &'static str = "@REMOTEHOSTNAME";

pub const DEFAULT_OFFLINE_NOTICE: &'static str =
  "### The game has gone down. Your connection is being held open while it restarts. ###\n";
pub const DEFAULT_ONLINE_NOTICE: &'static str =
  "### The game is back up. Your session has been reconnected. ###\n";

/// raw configuration file contents, every field optional
#[derive(Debug,Clone,PartialEq,Eq,Default,Deserialize)]
pub struct FileConfig {
  pub mush_address:       Option<String>,
  pub local_port:         Option<u16>,
  pub heartbeat_interval: Option<u64>,
  pub heartbeat_user:     Option<String>,
  pub heartbeat_password: Option<String>,
  pub connect_success:    Option<String>,
  pub connect_fail:       Option<String>,
  pub remotehostname_cmd: Option<String>,
  pub offline_notice:     Option<String>,
  pub online_notice:      Option<String>,
  pub auth_timeout:       Option<u64>,
  pub unauth_timeout:     Option<u64>,
  pub probe_timeout:      Option<u64>,
}

impl FileConfig {
  pub fn load_from_path(path: &str) -> io::Result<FileConfig> {
    let mut f = File::open(path)?;
    let mut data = String::new();
    f.read_to_string(&mut data)?;
    FileConfig::parse(&data)
  }

  pub fn parse(data: &str) -> io::Result<FileConfig> {
    toml::from_str(data).map_err(|e| {
      io::Error::new(ErrorKind::InvalidData, format!("decoding error: {}", e))
    })
  }

  pub fn into_config(self) -> Config {
    Config {
      mush_address:       self.mush_address.unwrap_or_else(|| String::from(DEFAULT_MUSH_ADDRESS)),
      local_port:         self.local_port.unwrap_or(DEFAULT_LOCAL_PORT),
      heartbeat_interval: self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
      heartbeat_user:     self.heartbeat_user.unwrap_or_else(|| String::from("holdfast")),
      heartbeat_password: self.heartbeat_password.unwrap_or_else(|| String::from("holdfast")),
      connect_success:    self.connect_success.unwrap_or_else(|| String::from(DEFAULT_CONNECT_SUCCESS)),
      connect_fail:       self.connect_fail.unwrap_or_else(|| String::from(DEFAULT_CONNECT_FAIL)),
      remotehostname_cmd: self.remotehostname_cmd.unwrap_or_else(|| String::from(DEFAULT_REMOTEHOSTNAME_CMD)),
      offline_notice:     self.offline_notice.unwrap_or_else(|| String::from(DEFAULT_OFFLINE_NOTICE)),
      online_notice:      self.online_notice.unwrap_or_else(|| String::from(DEFAULT_ONLINE_NOTICE)),
      auth_timeout:       self.auth_timeout.unwrap_or(DEFAULT_AUTH_TIMEOUT),
      unauth_timeout:     self.unauth_timeout.unwrap_or(DEFAULT_UNAUTH_TIMEOUT),
      probe_timeout:      self.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
    }
  }
}

/// resolved configuration as consumed by the proxy
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct Config {
  /// backend address, `host:port`
  pub mush_address:       String,
  /// listening port for client connections
  pub local_port:         u16,
  /// seconds between attempts to open the heartbeat connection
  pub heartbeat_interval: u64,
  pub heartbeat_user:     String,
  pub heartbeat_password: String,
  /// pattern matched against backend lines to confirm a login
  pub connect_success:    String,
  /// pattern matched against backend lines to reject a login
  pub connect_fail:       String,
  /// command announcing the real client address on a fresh backend
  /// connection, empty to disable
  pub remotehostname_cmd: String,
  /// written verbatim to every client at failover teardown
  pub offline_notice:     String,
  /// written verbatim to a client once its session is reconnected
  pub online_notice:      String,
  /// seconds before an unconfirmed login attempt is dropped
  pub auth_timeout:       u64,
  /// seconds an unauthenticated session may live
  pub unauth_timeout:     u64,
  /// seconds to wait for a heartbeat answer before declaring failover
  pub probe_timeout:      u64,
}

impl Config {
  pub fn load_from_path(path: &str) -> io::Result<Config> {
    let file_config = match FileConfig::load_from_path(path) {
      Ok(c) => c,
      Err(ref e) if e.kind() == ErrorKind::NotFound => {
        warn!("configuration file {} not found, using defaults", path);
        FileConfig::default()
      },
      Err(e) => return Err(e),
    };
    Ok(file_config.into_config())
  }
}

impl Default for Config {
  fn default() -> Config {
    FileConfig::default().into_config()
  }
}
