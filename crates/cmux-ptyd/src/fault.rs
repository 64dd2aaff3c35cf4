//! Deterministic fault injection for exercising client fallback paths.
//!
//! A [`FaultPolicy`] is built once from configuration and resolved into a
//! [`FaultMode`] at the start of every connection. The handler applies the
//! resolved mode before touching auth or the registry.

use std::{fmt, str::FromStr, time::Duration};

use crate::config::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    #[default]
    Off,
    /// Reject every connection attempt.
    Refuse,
    /// Hold the connection for a fixed duration, then proceed normally.
    Delay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection refused by fault injection")]
pub struct FaultRefusal;

impl FaultMode {
    pub async fn admit(self) -> Result<(), FaultRefusal> {
        match self {
            FaultMode::Off => Ok(()),
            FaultMode::Refuse => Err(FaultRefusal),
            FaultMode::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

impl FromStr for FaultMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "off" | "none" => return Ok(FaultMode::Off),
            "refuse" => return Ok(FaultMode::Refuse),
            _ => {}
        }
        match value.split_once(':') {
            Some((kind, delay)) if kind.eq_ignore_ascii_case("delay") => {
                parse_duration(delay).map(FaultMode::Delay)
            }
            _ => Err(format!(
                "unknown fault mode '{}' (expected off, refuse or delay:<duration>)",
                value
            )),
        }
    }
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultMode::Off => f.write_str("off"),
            FaultMode::Refuse => f.write_str("refuse"),
            FaultMode::Delay(delay) => write!(f, "delay:{}ms", delay.as_millis()),
        }
    }
}

pub fn parse_fault_mode(value: &str) -> Result<FaultMode, String> {
    value.parse()
}

#[derive(Debug, Clone, Copy)]
pub struct FaultPolicy {
    configured: FaultMode,
    allow_override: bool,
}

impl FaultPolicy {
    pub fn new(configured: FaultMode, allow_override: bool) -> Self {
        Self {
            configured,
            allow_override,
        }
    }

    /// Per-request overrides only apply when enabled; an unparsable override
    /// falls back to the configured mode.
    pub fn resolve(&self, requested: Option<&str>) -> FaultMode {
        if !self.allow_override {
            return self.configured;
        }
        requested
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_parse_modes() {
        assert_eq!("off".parse::<FaultMode>(), Ok(FaultMode::Off));
        assert_eq!("".parse::<FaultMode>(), Ok(FaultMode::Off));
        assert_eq!("REFUSE".parse::<FaultMode>(), Ok(FaultMode::Refuse));
        assert_eq!(
            "delay:250ms".parse::<FaultMode>(),
            Ok(FaultMode::Delay(Duration::from_millis(250)))
        );
        assert_eq!(
            "delay:2".parse::<FaultMode>(),
            Ok(FaultMode::Delay(Duration::from_secs(2)))
        );
        assert!("explode".parse::<FaultMode>().is_err());
        assert!("delay:soon".parse::<FaultMode>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let mode = FaultMode::Delay(Duration::from_millis(1500));
        assert_eq!(mode.to_string().parse::<FaultMode>(), Ok(mode));
    }

    #[test]
    fn test_override_ignored_unless_allowed() {
        let locked = FaultPolicy::new(FaultMode::Off, false);
        assert_eq!(locked.resolve(Some("refuse")), FaultMode::Off);

        let open = FaultPolicy::new(FaultMode::Off, true);
        assert_eq!(open.resolve(Some("refuse")), FaultMode::Refuse);
        assert_eq!(open.resolve(Some("garbage")), FaultMode::Off);
        assert_eq!(open.resolve(None), FaultMode::Off);
    }

    #[tokio::test]
    async fn test_refuse_and_delay() {
        assert_eq!(FaultMode::Refuse.admit().await, Err(FaultRefusal));
        assert_eq!(FaultMode::Off.admit().await, Ok(()));

        let started = Instant::now();
        FaultMode::Delay(Duration::from_millis(50))
            .admit()
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
