use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the peer configuration.
///
/// - `tracker_host` / `tracker_port`: the tracker endpoint (empty host
///   leaves it unset until `set tracker` is issued),
/// - `shared_directory`: the directory served to other peers (empty
///   leaves it unset),
/// - `check_alive_threshold_ms`: bound on a liveness probe round trip,
/// - `cleaning_interval_ms`: period of the peer server's idle cleaner,
/// - `cooperative_logout`: when true the peer sends LOGOUT even after a
///   local session loss, to help the tracker free state faster,
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tracker_host: String,
    pub tracker_port: u16,
    pub shared_directory: String,
    pub check_alive_threshold_ms: u64,
    pub cleaning_interval_ms: u64,
    pub cooperative_logout: bool,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            tracker_host: String::new(),
            tracker_port: 0,
            shared_directory: String::new(),
            check_alive_threshold_ms: 1000,
            cleaning_interval_ms: 20000,
            cooperative_logout: true,
        }
    }
}

impl Cfg {
    /// Builds a Cfg from the config file at the given path, in
    /// {config_name}={config_value} format. Settings not present keep
    /// their default.
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
            constants::TRACKER_HOST => self.tracker_host = String::from(value),

            constants::TRACKER_PORT => {
                self.tracker_port = self.parse_value(value, constants::TRACKER_PORT)?;
            }

            constants::SHARED_DIRECTORY => self.shared_directory = String::from(value),

            constants::CHECK_ALIVE_THRESHOLD_MS => {
                self.check_alive_threshold_ms =
                    self.parse_value(value, constants::CHECK_ALIVE_THRESHOLD_MS)?;
            }

            constants::CLEANING_INTERVAL_MS => {
                self.cleaning_interval_ms =
                    self.parse_value(value, constants::CLEANING_INTERVAL_MS)?;
            }

            constants::COOPERATIVE_LOGOUT => {
                self.cooperative_logout = self.parse_value(value, constants::COOPERATIVE_LOGOUT)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, io::Write, path::PathBuf};

    #[test]
    fn test_good_config() {
        let path = test_path("peer_good_config.cfg");
        let contents = b"TRACKER_HOST=10.0.0.1\nTRACKER_PORT=7770\nSHARED_DIRECTORY=./shared\nCHECK_ALIVE_THRESHOLD_MS=500\nCLEANING_INTERVAL_MS=1000\nCOOPERATIVE_LOGOUT=false";
        create_and_write_file(&path, contents);

        let config = Cfg::new(path.to_str().unwrap()).unwrap();

        assert_eq!(config.tracker_host, "10.0.0.1");
        assert_eq!(config.tracker_port, 7770);
        assert_eq!(config.shared_directory, "./shared");
        assert_eq!(config.check_alive_threshold_ms, 500);
        assert_eq!(config.cleaning_interval_ms, 1000);
        assert!(!config.cooperative_logout);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Cfg::default();

        assert_eq!(config.check_alive_threshold_ms, 1000);
        assert_eq!(config.cleaning_interval_ms, 20000);
        assert!(config.cooperative_logout);
    }

    #[test]
    fn test_threshold_not_a_number() {
        let path = test_path("peer_bad_threshold.cfg");
        create_and_write_file(&path, b"CHECK_ALIVE_THRESHOLD_MS=fast");

        assert!(Cfg::new(path.to_str().unwrap()).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_unknown_setting() {
        let path = test_path("peer_unknown_setting.cfg");
        create_and_write_file(&path, b"NOT_A_SETTING=1");

        assert!(Cfg::new(path.to_str().unwrap()).is_err());
        fs::remove_file(path).unwrap();
    }

    // Auxiliary functions

    fn test_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn create_and_write_file(path: &PathBuf, contents: &[u8]) {
        let mut file = File::create(path)
            .unwrap_or_else(|_| panic!("Error creating file in path: {:?}", &path));
        file.write_all(contents)
            .unwrap_or_else(|_| panic!("Error writing file in path: {:?}", &path));
    }
}
