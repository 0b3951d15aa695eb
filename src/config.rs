//! Process configuration.
//!
//! Every tunable is read from the environment once at startup; a missing or
//! malformed value is a fatal error surfaced to the operator before any
//! socket is bound.  [`Config`] itself is a plain struct so tests (and
//! embedders) can build one directly.

use std::time::Duration;

use thiserror::Error;

/// Fatal configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("could not parse {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("INITIAL_SEQ_NO {seq_no} must be below MaxSeqNo {max_seq_no}")]
    SeqNoOutOfRange { seq_no: u32, max_seq_no: u32 },
}

/// Process-wide settings, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Server bind port; also the port clients dial.
    pub listen_port: u16,
    /// Go-Back-N window size N.  The sequence space is `2 × N`.
    pub window_size: u32,
    /// First sequence number used by both sides of a stream.
    pub initial_seq_no: u32,
    /// Retransmission timer duration.
    pub retransmission_timeout: Duration,
    /// Deadline on each blocking socket read, so the reading task can
    /// observe cancellation between attempts.
    pub socket_read_timeout: Duration,
    /// Deadline on each blocking socket write.
    pub socket_write_timeout: Duration,
    /// Wire send queue capacity.
    pub send_queue_capacity: usize,
    /// Wire recv queue capacity.
    pub recv_queue_capacity: usize,
    /// Per-peer sender/receiver inbox capacity.
    pub peer_queue_capacity: usize,
    /// Per-peer gating stage capacity.
    pub gate_queue_capacity: usize,
    /// Application input queue capacity.
    pub input_queue_capacity: usize,
    /// Application output queue capacity.
    pub output_queue_capacity: usize,
}

impl Config {
    /// The sequence-number modulus: `2 × WindowSize`, the classic GBN
    /// constraint that lets a receiver distinguish new transmissions from
    /// stale duplicates.
    pub fn max_seq_no(&self) -> u32 {
        self.window_size * 2
    }

    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load the configuration from an arbitrary lookup function.
    ///
    /// `from_env` delegates here; tests pass a map instead of touching the
    /// process environment.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            listen_port: require(&lookup, "LISTEN_PORT")?,
            window_size: positive_u32(&lookup, "WINDOW_SIZE")?,
            initial_seq_no: match lookup("INITIAL_SEQ_NO") {
                None => 0,
                Some(value) => parse("INITIAL_SEQ_NO", value)?,
            },
            retransmission_timeout: millis(&lookup, "RETRANSMISSION_TIMEOUT_MS")?,
            socket_read_timeout: millis(&lookup, "SOCKET_READ_TIMEOUT_MS")?,
            socket_write_timeout: millis(&lookup, "SOCKET_WRITE_TIMEOUT_MS")?,
            send_queue_capacity: capacity(&lookup, "SEND_QUEUE_CAPACITY")?,
            recv_queue_capacity: capacity(&lookup, "RECV_QUEUE_CAPACITY")?,
            peer_queue_capacity: capacity(&lookup, "PEER_QUEUE_CAPACITY")?,
            gate_queue_capacity: capacity(&lookup, "GATE_QUEUE_CAPACITY")?,
            input_queue_capacity: capacity(&lookup, "INPUT_QUEUE_CAPACITY")?,
            output_queue_capacity: capacity(&lookup, "OUTPUT_QUEUE_CAPACITY")?,
        };

        if config.initial_seq_no >= config.max_seq_no() {
            return Err(ConfigError::SeqNoOutOfRange {
                seq_no: config.initial_seq_no,
                max_seq_no: config.max_seq_no(),
            });
        }
        Ok(config)
    }
}

fn require<F, T>(lookup: &F, name: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let value = lookup(name).ok_or(ConfigError::Missing(name))?;
    parse(name, value)
}

fn parse<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn positive_u32<F>(lookup: &F, name: &'static str) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match require(lookup, name)? {
        0 => Err(ConfigError::NotPositive(name)),
        n => Ok(n),
    }
}

fn capacity<F>(lookup: &F, name: &'static str) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match require(lookup, name)? {
        0 => Err(ConfigError::NotPositive(name)),
        n => Ok(n),
    }
}

fn millis<F>(lookup: &F, name: &'static str) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match require(lookup, name)? {
        0u64 => Err(ConfigError::NotPositive(name)),
        ms => Ok(Duration::from_millis(ms)),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("LISTEN_PORT", "7373"),
            ("WINDOW_SIZE", "4"),
            ("RETRANSMISSION_TIMEOUT_MS", "5000"),
            ("SOCKET_READ_TIMEOUT_MS", "250"),
            ("SOCKET_WRITE_TIMEOUT_MS", "250"),
            ("SEND_QUEUE_CAPACITY", "64"),
            ("RECV_QUEUE_CAPACITY", "32"),
            ("PEER_QUEUE_CAPACITY", "8"),
            ("GATE_QUEUE_CAPACITY", "4"),
            ("INPUT_QUEUE_CAPACITY", "4"),
            ("OUTPUT_QUEUE_CAPACITY", "4"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_vars(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn full_environment_parses() {
        let config = load(&full_env()).unwrap();
        assert_eq!(config.listen_port, 7373);
        assert_eq!(config.window_size, 4);
        assert_eq!(config.max_seq_no(), 8);
        assert_eq!(config.initial_seq_no, 0);
        assert_eq!(config.retransmission_timeout, Duration::from_secs(5));
        assert_eq!(config.send_queue_capacity, 64);
    }

    #[test]
    fn missing_variable_is_fatal() {
        let mut env = full_env();
        env.remove("WINDOW_SIZE");
        assert_eq!(load(&env), Err(ConfigError::Missing("WINDOW_SIZE")));
    }

    #[test]
    fn malformed_value_is_fatal() {
        let mut env = full_env();
        env.insert("LISTEN_PORT", "not-a-port");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { name: "LISTEN_PORT", .. })
        ));
    }

    #[test]
    fn zero_window_rejected() {
        let mut env = full_env();
        env.insert("WINDOW_SIZE", "0");
        assert_eq!(load(&env), Err(ConfigError::NotPositive("WINDOW_SIZE")));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut env = full_env();
        env.insert("RETRANSMISSION_TIMEOUT_MS", "0");
        assert_eq!(
            load(&env),
            Err(ConfigError::NotPositive("RETRANSMISSION_TIMEOUT_MS"))
        );
    }

    #[test]
    fn initial_seq_no_defaults_to_zero_and_is_range_checked() {
        let mut env = full_env();
        env.insert("INITIAL_SEQ_NO", "7");
        assert_eq!(load(&env).unwrap().initial_seq_no, 7);

        env.insert("INITIAL_SEQ_NO", "8"); // MaxSeqNo for WINDOW_SIZE=4
        assert_eq!(
            load(&env),
            Err(ConfigError::SeqNoOutOfRange {
                seq_no: 8,
                max_seq_no: 8
            })
        );
    }
}
