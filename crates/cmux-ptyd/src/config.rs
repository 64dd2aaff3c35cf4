//! Environment-driven configuration.
//!
//! Every option is a long flag and a `PTYD_*` environment variable.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{builder::BoolishValueParser, ArgAction, Parser};
use tracing::info;

use crate::{
    auth::{parse_credential, Credential},
    fault::{parse_fault_mode, FaultMode},
    pty::{ProcessSpec, TerminalCaps, PTY_READ_BUFFER_SIZE},
};

#[derive(Parser, Debug, Clone)]
#[command(name = "cmux-ptyd")]
#[command(about = "Resumable PTY sessions over WebSocket")]
#[command(version)]
pub struct Config {
    /// Address for the WebSocket listener
    #[arg(long, env = "PTYD_LISTEN", default_value = "0.0.0.0:39390")]
    pub listen: SocketAddr,

    /// Address for the metrics and health listener
    #[arg(long, env = "PTYD_METRICS_LISTEN", default_value = "0.0.0.0:39391")]
    pub metrics_listen: SocketAddr,

    /// Program started inside each session's PTY
    #[arg(long, env = "PTYD_COMMAND", default_value = "/bin/sh")]
    pub command: String,

    /// Arguments for the program (space separated in the environment)
    #[arg(
        long = "arg",
        env = "PTYD_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,

    /// Working directory for the program
    #[arg(long, env = "PTYD_CWD")]
    pub cwd: Option<PathBuf>,

    #[arg(long, env = "PTYD_TERM", default_value = "xterm-256color")]
    pub term: String,

    /// Value for LANG and LC_ALL
    #[arg(long, env = "PTYD_LANG", default_value = "en_US.UTF-8")]
    pub lang: String,

    /// Advertise truecolor through COLORTERM
    #[arg(long, env = "PTYD_TRUECOLOR", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub truecolor: bool,

    #[arg(long, env = "PTYD_ROWS", default_value_t = 24)]
    pub rows: u16,

    #[arg(long, env = "PTYD_COLS", default_value_t = 80)]
    pub cols: u16,

    /// Maximum live sessions per origin address
    #[arg(long, env = "PTYD_PER_ORIGIN_CAP", default_value_t = 5)]
    pub per_origin_cap: usize,

    /// Maximum live sessions overall
    #[arg(long, env = "PTYD_GLOBAL_CAP", default_value_t = 50)]
    pub global_cap: usize,

    /// Replay buffer byte limit per session
    #[arg(long, env = "PTYD_RING_MAX_BYTES", default_value_t = 1024 * 1024)]
    pub ring_max_bytes: usize,

    /// Replay buffer frame limit per session
    #[arg(long, env = "PTYD_RING_MAX_FRAMES", default_value_t = 4096)]
    pub ring_max_frames: usize,

    /// How often the idle sweep runs
    #[arg(long, env = "PTYD_SWEEP_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub sweep_interval: Duration,

    /// Time after disconnect before a session is marked idle
    #[arg(long, env = "PTYD_DISCONNECT_GRACE", default_value = "30s", value_parser = parse_duration)]
    pub disconnect_grace: Duration,

    /// Time after disconnect before a session is reaped
    #[arg(long, env = "PTYD_IDLE_THRESHOLD", default_value = "30m", value_parser = parse_duration)]
    pub idle_threshold: Duration,

    /// Lifetime of an armed reconnect token
    #[arg(long, env = "PTYD_TOKEN_TTL", default_value = "30m", value_parser = parse_duration)]
    pub token_ttl: Duration,

    #[arg(long, env = "PTYD_KEEPALIVE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub keepalive_interval: Duration,

    /// How long to wait for a pong before treating the connection as dead
    #[arg(long, env = "PTYD_KEEPALIVE_TIMEOUT", default_value = "20s", value_parser = parse_duration)]
    pub keepalive_timeout: Duration,

    /// Drop input that is not passive navigation
    #[arg(long, env = "PTYD_READ_ONLY", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub read_only: bool,

    /// Minimum spacing of read-only notices per connection
    #[arg(long, env = "PTYD_NOTICE_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub notice_interval: Duration,

    /// Bearer credential required from clients
    #[arg(long, env = "PTYD_AUTH_TOKEN", hide_env_values = true, value_parser = parse_credential)]
    pub auth_token: Option<Credential>,

    /// off, refuse or delay:<duration>
    #[arg(long, env = "PTYD_FAULT_MODE", default_value = "off", value_parser = parse_fault_mode)]
    pub fault_mode: FaultMode,

    /// Honor per-request fault overrides
    #[arg(long, env = "PTYD_FAULT_OVERRIDE", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub fault_override: bool,

    /// Take the origin address from X-Forwarded-For
    #[arg(long, env = "PTYD_TRUST_FORWARDED_FOR", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub trust_forwarded_for: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("ring_max_bytes ({0}) must hold at least one PTY read ({1} bytes)")]
    RingTooSmall(usize, usize),

    #[error("idle_threshold ({0:?}) must not be shorter than sweep_interval ({1:?})")]
    ThresholdBelowSweep(Duration, Duration),
}

impl Default for Config {
    /// Built-in defaults overlaid with any `PTYD_*` variables present.
    fn default() -> Self {
        Self::parse_from(["cmux-ptyd"])
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("per_origin_cap", self.per_origin_cap),
            ("global_cap", self.global_cap),
            ("ring_max_frames", self.ring_max_frames),
            ("rows", usize::from(self.rows)),
            ("cols", usize::from(self.cols)),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value) in [
            ("sweep_interval", self.sweep_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("keepalive_timeout", self.keepalive_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.ring_max_bytes < PTY_READ_BUFFER_SIZE {
            return Err(ConfigError::RingTooSmall(
                self.ring_max_bytes,
                PTY_READ_BUFFER_SIZE,
            ));
        }
        if self.idle_threshold < self.sweep_interval {
            return Err(ConfigError::ThresholdBelowSweep(
                self.idle_threshold,
                self.sweep_interval,
            ));
        }
        Ok(())
    }

    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: Vec::new(),
        }
    }

    pub fn terminal_caps(&self) -> TerminalCaps {
        TerminalCaps {
            rows: self.rows,
            cols: self.cols,
            term: self.term.clone(),
            lang: self.lang.clone(),
            truecolor: self.truecolor,
        }
    }

    /// Logs every setting except the credential itself.
    pub fn log_startup(&self) {
        info!("Configuration:");
        info!("  listen: {}", self.listen);
        info!("  metrics_listen: {}", self.metrics_listen);
        info!("  command: {} {}", self.command, self.args.join(" "));
        if let Some(cwd) = &self.cwd {
            info!("  cwd: {}", cwd.display());
        }
        info!(
            "  terminal: TERM={} LANG={} truecolor={} size={}x{}",
            self.term, self.lang, self.truecolor, self.cols, self.rows
        );
        info!(
            "  admission: per_origin_cap={} global_cap={}",
            self.per_origin_cap, self.global_cap
        );
        info!(
            "  ring: max_bytes={} max_frames={}",
            self.ring_max_bytes, self.ring_max_frames
        );
        info!(
            "  reap: sweep_interval={:?} disconnect_grace={:?} idle_threshold={:?} token_ttl={:?}",
            self.sweep_interval, self.disconnect_grace, self.idle_threshold, self.token_ttl
        );
        info!(
            "  keepalive: interval={:?} timeout={:?}",
            self.keepalive_interval, self.keepalive_timeout
        );
        info!(
            "  read_only: {} (notice_interval={:?})",
            self.read_only, self.notice_interval
        );
        info!(
            "  auth: {}",
            if self.auth_token.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );
        info!(
            "  fault_mode: {} (override={})",
            self.fault_mode, self.fault_override
        );
        info!("  trust_forwarded_for: {}", self.trust_forwarded_for);
    }
}

/// Parses `500ms`, `30s`, `5m`, `2h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    let scaled = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{}' is too large", value))
    };
    match unit.trim() {
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" | "min" | "mins" => scaled(60),
        "h" => scaled(3600),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["cmux-ptyd"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("3 days").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let huge = format!("{}h", u64::MAX / 1000);
        assert!(parse_duration(&huge).unwrap_err().contains("too large"));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert_eq!(
            parse_duration(&format!("{}", u64::MAX)),
            Ok(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--per-origin-cap",
            "3",
            "--idle-threshold",
            "90s",
            "--read-only",
            "yes",
            "--fault-mode",
            "delay:100ms",
            "--arg",
            "-c",
            "--arg",
            "true",
        ]);
        assert_eq!(config.per_origin_cap, 3);
        assert_eq!(config.idle_threshold, Duration::from_secs(90));
        assert!(config.read_only);
        assert_eq!(config.fault_mode, FaultMode::Delay(Duration::from_millis(100)));
        assert_eq!(config.args, vec!["-c".to_string(), "true".to_string()]);
    }

    #[test]
    fn test_invalid_fault_mode_rejected() {
        assert!(Config::try_parse_from(["cmux-ptyd", "--fault-mode", "boom"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let config = parse(&["--global-cap", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::Zero("global_cap")));

        let config = parse(&["--ring-max-bytes", "16"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RingTooSmall(16, _))
        ));

        let config = parse(&["--idle-threshold", "1s", "--sweep-interval", "5s"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdBelowSweep(_, _))
        ));
    }

    #[test]
    fn test_credential_not_in_debug_output() {
        let config = parse(&["--auth-token", "top-secret-value"]);
        assert!(config.auth_token.is_some());
        assert!(!format!("{:?}", config).contains("top-secret-value"));
    }

    #[test]
    fn test_terminal_caps_follow_config() {
        let config = parse(&["--rows", "40", "--cols", "120", "--term", "xterm"]);
        let caps = config.terminal_caps();
        assert_eq!((caps.rows, caps.cols), (40, 120));
        assert_eq!(caps.term, "xterm");
    }
}
