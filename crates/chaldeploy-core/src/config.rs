//! Challenge configuration loaded from `CHALDEPLOY_*` environment variables.
//!
//! Every variable is declared once in [`ENV_VARS`] together with whether it
//! is required and the parser that applies it. Loading walks that table, so
//! adding a setting means adding one row.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Default lifetime of an instance, and the amount added per extension.
pub const DEFAULT_RUNTIME: Duration = Duration::from_secs(5 * 60);
/// Longest accepted instance runtime.
pub const MAX_RUNTIME: Duration = Duration::from_secs(30 * 24 * 3600);
/// Default address the HTTP layer listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5050";
/// Default period between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Default grace period before the first readiness/termination poll.
pub const DEFAULT_POLL_INITIAL_WAIT: Duration = Duration::from_secs(20);
/// Default number of readiness/termination polls before giving up.
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 6;

/// Settings for one challenge deployment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeConfig {
    /// `$CHALDEPLOY_NAME`: name of the challenge to deploy.
    pub challenge_name: String,
    /// `$CHALDEPLOY_PORT`: port exposed by the challenge container.
    pub challenge_port: u16,
    /// `$CHALDEPLOY_IMAGE`: image reference for the challenge container.
    pub challenge_image: String,
    /// `$CHALDEPLOY_K8SCONFIG`: explicit kubeconfig path. When unset the
    /// cluster config is inferred (service account, then `~/.kube/config`).
    pub kubeconfig_path: Option<PathBuf>,
    /// `$CHALDEPLOY_RUNTIME`: instance lifetime and extension step.
    pub runtime: Duration,
    /// `$CHALDEPLOY_LISTEN`: HTTP listen address.
    pub listen_addr: SocketAddr,
    /// `$CHALDEPLOY_SWEEP_INTERVAL`: period of the expiration sweep.
    pub sweep_interval: Duration,
    /// `$CHALDEPLOY_POLL_INITIAL_WAIT`: grace period before polling.
    pub poll_initial_wait: Duration,
    /// `$CHALDEPLOY_POLL_MAX_ATTEMPTS`: poll attempt bound.
    pub poll_max_attempts: u32,
}

/// Partially-populated config while the variable table is applied.
#[derive(Debug, Default)]
struct ConfigBuilder {
    challenge_name: Option<String>,
    challenge_port: Option<u16>,
    challenge_image: Option<String>,
    kubeconfig_path: Option<PathBuf>,
    runtime: Option<Duration>,
    listen_addr: Option<SocketAddr>,
    sweep_interval: Option<Duration>,
    poll_initial_wait: Option<Duration>,
    poll_max_attempts: Option<u32>,
}

/// One row of the environment table.
struct EnvVar {
    name: &'static str,
    required: bool,
    apply: fn(&mut ConfigBuilder, &'static str, &str) -> ConfigResult<()>,
}

const ENV_VARS: &[EnvVar] = &[
    EnvVar { name: "CHALDEPLOY_NAME", required: true, apply: set_challenge_name },
    EnvVar { name: "CHALDEPLOY_PORT", required: true, apply: set_challenge_port },
    EnvVar { name: "CHALDEPLOY_IMAGE", required: true, apply: set_challenge_image },
    EnvVar { name: "CHALDEPLOY_K8SCONFIG", required: false, apply: set_kubeconfig_path },
    EnvVar { name: "CHALDEPLOY_RUNTIME", required: false, apply: set_runtime },
    EnvVar { name: "CHALDEPLOY_LISTEN", required: false, apply: set_listen_addr },
    EnvVar { name: "CHALDEPLOY_SWEEP_INTERVAL", required: false, apply: set_sweep_interval },
    EnvVar { name: "CHALDEPLOY_POLL_INITIAL_WAIT", required: false, apply: set_poll_initial_wait },
    EnvVar { name: "CHALDEPLOY_POLL_MAX_ATTEMPTS", required: false, apply: set_poll_max_attempts },
];

fn set_challenge_name(b: &mut ConfigBuilder, _: &'static str, v: &str) -> ConfigResult<()> {
    b.challenge_name = Some(v.to_string());
    Ok(())
}

fn set_challenge_port(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    b.challenge_port = Some(parse_port(var, v)?);
    Ok(())
}

fn set_challenge_image(b: &mut ConfigBuilder, _: &'static str, v: &str) -> ConfigResult<()> {
    b.challenge_image = Some(v.to_string());
    Ok(())
}

fn set_kubeconfig_path(b: &mut ConfigBuilder, _: &'static str, v: &str) -> ConfigResult<()> {
    b.kubeconfig_path = Some(PathBuf::from(v));
    Ok(())
}

fn set_runtime(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    let runtime = parse_nonzero_duration(var, v)?;
    if runtime > MAX_RUNTIME {
        return Err(ConfigError::TooLarge {
            var,
            max: MAX_RUNTIME.as_secs(),
            value: runtime.as_secs(),
        });
    }
    b.runtime = Some(runtime);
    Ok(())
}

fn set_listen_addr(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    let addr = v.parse().map_err(|_| ConfigError::InvalidAddress {
        var,
        value: v.to_string(),
    })?;
    b.listen_addr = Some(addr);
    Ok(())
}

fn set_sweep_interval(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    b.sweep_interval = Some(parse_nonzero_duration(var, v)?);
    Ok(())
}

fn set_poll_initial_wait(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    b.poll_initial_wait = Some(parse_env_duration(var, v)?);
    Ok(())
}

fn set_poll_max_attempts(b: &mut ConfigBuilder, var: &'static str, v: &str) -> ConfigResult<()> {
    let attempts: u32 = v.parse().map_err(|_| ConfigError::InvalidInteger {
        var,
        value: v.to_string(),
    })?;
    if attempts == 0 {
        return Err(ConfigError::TooSmall { var, min: 1, value: 0 });
    }
    b.poll_max_attempts = Some(attempts);
    Ok(())
}

impl ChallengeConfig {
    /// Load the config from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the config through an arbitrary variable lookup.
    ///
    /// Values are trimmed; empty values are treated the same as unset ones.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = ConfigBuilder::default();

        for var in ENV_VARS {
            let value = lookup(var.name).map(|v| v.trim().to_string());
            match value.filter(|v| !v.is_empty()) {
                Some(value) => (var.apply)(&mut builder, var.name, &value)?,
                None if var.required => return Err(ConfigError::Missing(var.name)),
                None => debug!(var = var.name, "optional variable unset, using default"),
            }
        }

        builder.finish()
    }

    /// Construct a config with defaults for everything but the challenge.
    pub fn new(challenge_name: &str, challenge_image: &str, challenge_port: u16) -> Self {
        Self {
            challenge_name: challenge_name.to_string(),
            challenge_port,
            challenge_image: challenge_image.to_string(),
            kubeconfig_path: None,
            runtime: DEFAULT_RUNTIME,
            listen_addr: default_listen_addr(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            poll_initial_wait: DEFAULT_POLL_INITIAL_WAIT,
            poll_max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

impl ConfigBuilder {
    fn finish(self) -> ConfigResult<ChallengeConfig> {
        Ok(ChallengeConfig {
            challenge_name: self
                .challenge_name
                .ok_or(ConfigError::Missing("CHALDEPLOY_NAME"))?,
            challenge_port: self
                .challenge_port
                .ok_or(ConfigError::Missing("CHALDEPLOY_PORT"))?,
            challenge_image: self
                .challenge_image
                .ok_or(ConfigError::Missing("CHALDEPLOY_IMAGE"))?,
            kubeconfig_path: self.kubeconfig_path,
            runtime: self.runtime.unwrap_or(DEFAULT_RUNTIME),
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            sweep_interval: self.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
            poll_initial_wait: self.poll_initial_wait.unwrap_or(DEFAULT_POLL_INITIAL_WAIT),
            poll_max_attempts: self.poll_max_attempts.unwrap_or(DEFAULT_POLL_MAX_ATTEMPTS),
        })
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5050))
}

fn parse_port(var: &'static str, value: &str) -> ConfigResult<u16> {
    let port: i64 = value.parse().map_err(|_| ConfigError::InvalidInteger {
        var,
        value: value.to_string(),
    })?;
    if !(1..=65535).contains(&port) {
        return Err(ConfigError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

fn parse_nonzero_duration(var: &'static str, value: &str) -> ConfigResult<Duration> {
    let duration = parse_env_duration(var, value)?;
    if duration.is_zero() {
        return Err(ConfigError::TooSmall { var, min: 1, value: 0 });
    }
    Ok(duration)
}

fn parse_env_duration(var: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        var,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "5m", "1h" or plain seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CHALDEPLOY_NAME", "test chal name"),
            ("CHALDEPLOY_PORT", "12345"),
            ("CHALDEPLOY_IMAGE", "testimg:latest"),
        ]
    }

    #[test]
    fn full_config() {
        let mut vars = required_vars();
        vars.extend([
            ("CHALDEPLOY_K8SCONFIG", "/asdf/zxcv"),
            ("CHALDEPLOY_RUNTIME", "10m"),
            ("CHALDEPLOY_LISTEN", "127.0.0.1:8080"),
            ("CHALDEPLOY_SWEEP_INTERVAL", "15s"),
            ("CHALDEPLOY_POLL_INITIAL_WAIT", "0"),
            ("CHALDEPLOY_POLL_MAX_ATTEMPTS", "3"),
        ]);

        let config = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.challenge_name, "test chal name");
        assert_eq!(config.challenge_port, 12345);
        assert_eq!(config.challenge_image, "testimg:latest");
        assert_eq!(config.kubeconfig_path, Some(PathBuf::from("/asdf/zxcv")));
        assert_eq!(config.runtime, Duration::from_secs(600));
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.poll_initial_wait, Duration::ZERO);
        assert_eq!(config.poll_max_attempts, 3);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = ChallengeConfig::from_lookup(lookup_from(&required_vars())).unwrap();
        assert_eq!(config.kubeconfig_path, None);
        assert_eq!(config.runtime, DEFAULT_RUNTIME);
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.poll_initial_wait, DEFAULT_POLL_INITIAL_WAIT);
        assert_eq!(config.poll_max_attempts, DEFAULT_POLL_MAX_ATTEMPTS);
    }

    #[test]
    fn missing_required_variable() {
        let vars = [
            ("CHALDEPLOY_NAME", "test chal name"),
            ("CHALDEPLOY_PORT", "12345"),
        ];
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CHALDEPLOY_IMAGE"));
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut vars = required_vars();
        vars[0] = ("CHALDEPLOY_NAME", "   ");
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CHALDEPLOY_NAME"));
    }

    #[test]
    fn invalid_port() {
        let mut vars = required_vars();
        vars[1] = ("CHALDEPLOY_PORT", "zzz");
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInteger { var: "CHALDEPLOY_PORT", .. }));
    }

    #[test]
    fn port_out_of_range() {
        for bad in ["0", "65536", "-4"] {
            let mut vars = required_vars();
            vars[1] = ("CHALDEPLOY_PORT", bad);
            let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
            assert!(matches!(err, ConfigError::PortOutOfRange(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn zero_runtime_rejected() {
        let mut vars = required_vars();
        vars.push(("CHALDEPLOY_RUNTIME", "0s"));
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::TooSmall { var: "CHALDEPLOY_RUNTIME", .. }));
    }

    #[test]
    fn runtime_is_bounded() {
        let mut vars = required_vars();
        vars.push(("CHALDEPLOY_RUNTIME", "3000000000h"));
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TooLarge { var: "CHALDEPLOY_RUNTIME", max, .. } if max == MAX_RUNTIME.as_secs()
        ));

        let mut vars = required_vars();
        vars.push(("CHALDEPLOY_RUNTIME", "720h"));
        let config = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.runtime, MAX_RUNTIME);
    }

    #[test]
    fn invalid_listen_address() {
        let mut vars = required_vars();
        vars.push(("CHALDEPLOY_LISTEN", "not-an-addr"));
        let err = ChallengeConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }
}
