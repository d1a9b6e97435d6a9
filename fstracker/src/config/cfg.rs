use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the tracker configuration.
///
/// - `tcp_port`: port the tracker listens on (0 lets the OS pick),
/// - `store_path`: path of the credential store file,
/// - `peer_remote_host`: when true the tracker trusts the host a peer
///   announces; when false it overwrites it with the socket peer address,
/// - `cleaning_interval_ms`: period of the idle-connection cleaner,
/// - `peer_penalty_ms`: search delay applied to users with no recorded
///   downloads (0 disables the penalty),
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tcp_port: u16,
    pub store_path: String,
    pub peer_remote_host: bool,
    pub cleaning_interval_ms: u64,
    pub peer_penalty_ms: u64,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            tcp_port: 7770,
            store_path: String::from("./users.json"),
            peer_remote_host: false,
            cleaning_interval_ms: 20000,
            peer_penalty_ms: 100,
        }
    }
}

impl Cfg {
    /// Builds a Cfg from the config file at the given path. The format
    /// must be: {config_name}={config_value} (without brackets), one per
    /// line. Settings not present in the file keep their default.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be read.
    /// - A line is not a name=value pair.
    /// - A wrong config_name was in the config file.
    /// - A numeric or boolean setting could not be parsed.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self::default();

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let current_line = line?;
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = cfg.load_setting(setting[0], setting[1])?;
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = self.parse_value(value, constants::TCP_PORT)?;
            }
            constants::STORE_PATH => self.store_path = String::from(value),

            constants::PEER_REMOTE_HOST => {
                self.peer_remote_host = self.parse_value(value, constants::PEER_REMOTE_HOST)?;
            }

            constants::CLEANING_INTERVAL_MS => {
                self.cleaning_interval_ms =
                    self.parse_value(value, constants::CLEANING_INTERVAL_MS)?;
            }

            constants::PEER_PENALTY_MS => {
                self.peer_penalty_ms = self.parse_value(value, constants::PEER_PENALTY_MS)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        match value.parse::<F>() {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parsed) => Ok(parsed),
        }
    }
}
