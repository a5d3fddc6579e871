// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection, consumer and producer tunables.
//!
//! A `Config` is built once, validated, and cloned by every component that
//! takes it, so later changes to the caller's copy have no effect on
//! running connections.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("invalid value for {option}: {reason}")]
    InvalidValue { option: String, reason: String },
    #[error("{option} {value} out of range [{min}, {max}]")]
    OutOfRange {
        option: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Computes the pause for a given backoff level.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn calculate(&self, multiplier: Duration, attempt: u32) -> Duration;
}

/// `multiplier * 2^attempt`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExponentialStrategy;

impl BackoffStrategy for ExponentialStrategy {
    fn calculate(&self, multiplier: Duration, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        multiplier.saturating_mul(factor)
    }
}

/// Uniformly random in `[0, multiplier * 2^attempt)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullJitterStrategy;

impl BackoffStrategy for FullJitterStrategy {
    fn calculate(&self, multiplier: Duration, attempt: u32) -> Duration {
        let ceiling = ExponentialStrategy.calculate(multiplier, attempt);
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::random_range(0..nanos))
    }
}

/// A value handed to [`Config::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Duration(Duration),
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v.into())
    }
}

impl From<u16> for OptionValue {
    fn from(v: u16) -> Self {
        OptionValue::Int(v.into())
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<Duration> for OptionValue {
    fn from(v: Duration) -> Self {
        OptionValue::Duration(v)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Str(s) => write!(f, "{:?}", s),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Duration(d) => write!(f, "{:?}", d),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dial_timeout: Duration,
    /// Deadline for each socket read; must exceed `heartbeat_interval`.
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub lookupd_poll_interval: Duration,
    /// Fraction of `lookupd_poll_interval` used as a random initial delay.
    pub lookupd_poll_jitter: f64,
    pub lookupd_poll_timeout: Duration,

    pub max_requeue_delay: Duration,
    pub default_requeue_delay: Duration,

    pub backoff_strategy: Arc<dyn BackoffStrategy>,
    pub max_backoff_duration: Duration,
    pub backoff_multiplier: Duration,

    /// Messages attempted more often are failed without reaching a handler.
    /// Zero disables the check.
    pub max_attempts: u16,

    pub low_rdy_idle_timeout: Duration,
    pub rdy_redistribute_interval: Duration,
    pub rdy_redistribute_on_idle: bool,

    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,

    pub heartbeat_interval: Duration,
    /// Percentage of the channel's messages to receive; 0 disables sampling.
    pub sample_rate: u32,

    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub snappy: bool,

    pub output_buffer_size: i64,
    pub output_buffer_timeout: Duration,

    pub max_in_flight: i64,
    /// Server-side message timeout; zero keeps the nsqd default.
    pub msg_timeout: Duration,
    pub auth_secret: Option<String>,
    /// Largest frame accepted from nsqd; zero means `MAX_FRAME_SIZE`.
    pub max_msg_size: u32,
}

const MINUTE: Duration = Duration::from_secs(60);

fn duration_bounds(option: &str) -> Option<(Duration, Option<Duration>)> {
    let bounds = match option {
        "dial_timeout" => (Duration::ZERO, None),
        "read_timeout" => (Duration::from_millis(100), Some(5 * MINUTE)),
        "write_timeout" => (Duration::from_millis(100), Some(5 * MINUTE)),
        "lookupd_poll_interval" => (Duration::from_millis(10), Some(5 * MINUTE)),
        "lookupd_poll_timeout" => (Duration::ZERO, None),
        "max_requeue_delay" => (Duration::ZERO, Some(60 * MINUTE)),
        "default_requeue_delay" => (Duration::ZERO, Some(60 * MINUTE)),
        "max_backoff_duration" => (Duration::ZERO, Some(60 * MINUTE)),
        "backoff_multiplier" => (Duration::ZERO, Some(60 * MINUTE)),
        "low_rdy_idle_timeout" => (Duration::from_secs(1), Some(5 * MINUTE)),
        "rdy_redistribute_interval" => (Duration::from_millis(1), Some(Duration::from_secs(5))),
        "heartbeat_interval" => (Duration::ZERO, None),
        "output_buffer_timeout" => (Duration::ZERO, None),
        "msg_timeout" => (Duration::ZERO, None),
        _ => return None,
    };
    Some(bounds)
}

fn int_bounds(option: &str) -> Option<(i64, i64)> {
    let bounds = match option {
        "max_attempts" => (0, u16::MAX as i64),
        "sample_rate" => (0, 99),
        "deflate_level" => (1, 9),
        "output_buffer_size" => (-1, i64::MAX),
        "max_in_flight" => (0, i64::MAX),
        "max_msg_size" => (0, u32::MAX as i64),
        _ => return None,
    };
    Some(bounds)
}

impl Default for Config {
    fn default() -> Self {
        let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
        let client_id = hostname.split('.').next().unwrap_or_default().to_string();

        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            lookupd_poll_timeout: Duration::from_secs(60),
            max_requeue_delay: 15 * MINUTE,
            default_requeue_delay: Duration::from_secs(90),
            backoff_strategy: Arc::new(ExponentialStrategy),
            max_backoff_duration: 2 * MINUTE,
            backoff_multiplier: Duration::from_secs(1),
            max_attempts: 5,
            low_rdy_idle_timeout: Duration::from_secs(10),
            rdy_redistribute_interval: Duration::from_secs(5),
            rdy_redistribute_on_idle: false,
            client_id,
            hostname,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            heartbeat_interval: Duration::from_secs(30),
            sample_rate: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            output_buffer_size: 16384,
            output_buffer_timeout: Duration::from_millis(250),
            max_in_flight: 1,
            msg_timeout: Duration::ZERO,
            auth_secret: None,
            max_msg_size: 0,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one option by its wire/CLI name.
    ///
    /// Durations accept `"1500ms"`-style strings, integer milliseconds or a
    /// `Duration`; booleans accept `"true"`/`"false"`, `bool` or 0/1.
    pub fn set(&mut self, option: &str, value: impl Into<OptionValue>) -> Result<(), ConfigError> {
        let value = value.into();

        if let Some((min, max)) = duration_bounds(option) {
            let d = to_duration(option, &value)?;
            check_duration(option, d, min, max)?;
            match option {
                "dial_timeout" => self.dial_timeout = d,
                "read_timeout" => self.read_timeout = d,
                "write_timeout" => self.write_timeout = d,
                "lookupd_poll_interval" => self.lookupd_poll_interval = d,
                "lookupd_poll_timeout" => self.lookupd_poll_timeout = d,
                "max_requeue_delay" => self.max_requeue_delay = d,
                "default_requeue_delay" => self.default_requeue_delay = d,
                "max_backoff_duration" => self.max_backoff_duration = d,
                "backoff_multiplier" => self.backoff_multiplier = d,
                "low_rdy_idle_timeout" => self.low_rdy_idle_timeout = d,
                "rdy_redistribute_interval" => self.rdy_redistribute_interval = d,
                "heartbeat_interval" => self.heartbeat_interval = d,
                "output_buffer_timeout" => self.output_buffer_timeout = d,
                "msg_timeout" => self.msg_timeout = d,
                _ => unreachable!("duration option without a field: {option}"),
            }
            return Ok(());
        }

        if let Some((min, max)) = int_bounds(option) {
            let i = to_int(option, &value)?;
            check_int(option, i, min, max)?;
            // bounds above guarantee the narrowing casts
            match option {
                "max_attempts" => self.max_attempts = i as u16,
                "sample_rate" => self.sample_rate = i as u32,
                "deflate_level" => self.deflate_level = i as u32,
                "output_buffer_size" => self.output_buffer_size = i,
                "max_in_flight" => self.max_in_flight = i,
                "max_msg_size" => self.max_msg_size = i as u32,
                _ => unreachable!("integer option without a field: {option}"),
            }
            return Ok(());
        }

        match option {
            "lookupd_poll_jitter" => {
                let f = to_float(option, &value)?;
                if !(0.0..=1.0).contains(&f) {
                    return Err(out_of_range(option, &value, 0, 1));
                }
                self.lookupd_poll_jitter = f;
            }
            "backoff_strategy" => {
                self.backoff_strategy = match to_string(option, &value)?.as_str() {
                    "" | "exponential" => Arc::new(ExponentialStrategy),
                    "full_jitter" => Arc::new(FullJitterStrategy),
                    other => return Err(invalid(option, format!("unknown strategy {other:?}"))),
                };
            }
            "rdy_redistribute_on_idle" => self.rdy_redistribute_on_idle = to_bool(option, &value)?,
            "tls_v1" => self.tls_v1 = to_bool(option, &value)?,
            "deflate" => self.deflate = to_bool(option, &value)?,
            "snappy" => self.snappy = to_bool(option, &value)?,
            "client_id" => self.client_id = to_string(option, &value)?,
            "hostname" => self.hostname = to_string(option, &value)?,
            "user_agent" => self.user_agent = to_string(option, &value)?,
            "auth_secret" => self.auth_secret = Some(to_string(option, &value)?),
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
        Ok(())
    }

    /// Checks every range and the cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("dial_timeout", self.dial_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("lookupd_poll_interval", self.lookupd_poll_interval),
            ("lookupd_poll_timeout", self.lookupd_poll_timeout),
            ("max_requeue_delay", self.max_requeue_delay),
            ("default_requeue_delay", self.default_requeue_delay),
            ("max_backoff_duration", self.max_backoff_duration),
            ("backoff_multiplier", self.backoff_multiplier),
            ("low_rdy_idle_timeout", self.low_rdy_idle_timeout),
            ("rdy_redistribute_interval", self.rdy_redistribute_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("output_buffer_timeout", self.output_buffer_timeout),
            ("msg_timeout", self.msg_timeout),
        ];
        for (option, value) in durations {
            if let Some((min, max)) = duration_bounds(option) {
                check_duration(option, value, min, max)?;
            }
        }

        let ints = [
            ("sample_rate", self.sample_rate as i64),
            ("deflate_level", self.deflate_level as i64),
            ("output_buffer_size", self.output_buffer_size),
            ("max_in_flight", self.max_in_flight),
        ];
        for (option, value) in ints {
            if let Some((min, max)) = int_bounds(option) {
                check_int(option, value, min, max)?;
            }
        }

        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(out_of_range(
                "lookupd_poll_jitter",
                &OptionValue::Float(self.lookupd_poll_jitter),
                0,
                1,
            ));
        }

        if self.heartbeat_interval >= self.read_timeout {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval {:?} must be less than read_timeout {:?}",
                self.heartbeat_interval, self.read_timeout
            )));
        }
        if self.deflate && self.snappy {
            return Err(ConfigError::Invalid(
                "cannot enable both deflate and snappy compression".into(),
            ));
        }
        if self.snappy {
            return Err(ConfigError::Invalid("snappy compression is not supported".into()));
        }
        if self.tls_v1 {
            return Err(ConfigError::Invalid("tls_v1 is not supported".into()));
        }
        Ok(())
    }

    pub(crate) fn backoff_duration(&self, attempt: u32) -> Duration {
        self.backoff_strategy.calculate(self.backoff_multiplier, attempt)
    }
}

fn invalid(option: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        reason: reason.into(),
    }
}

fn out_of_range(
            option: &str,
            value: &OptionValue,
            min: impl fmt::Display,
            max: impl fmt::Display
        ) -> ConfigError {
    ConfigError::OutOfRange {
        option: option.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}

fn check_duration(
            option: &str,
            value: Duration,
            min: Duration,
            max: Option<Duration>
        ) -> Result<(), ConfigError> {
    if value < min || max.is_some_and(|max| value > max) {
        return Err(out_of_range(
            option,
            &OptionValue::Duration(value),
            format!("{:?}", min),
            max.map_or_else(|| "inf".to_string(), |m| format!("{:?}", m)),
        ));
    }
    Ok(())
}

fn check_int(option: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(out_of_range(option, &OptionValue::Int(value), min, max));
    }
    Ok(())
}

fn to_duration(option: &str, value: &OptionValue) -> Result<Duration, ConfigError> {
    match value {
        OptionValue::Duration(d) => Ok(*d),
        OptionValue::Int(ms) => u64::try_from(*ms)
            .map(Duration::from_millis)
            .map_err(|_| invalid(option, "negative duration")),
        OptionValue::Str(s) => parse_duration(s).map_err(|reason| invalid(option, reason)),
        other => Err(invalid(option, format!("expected a duration, got {other}"))),
    }
}

fn to_int(option: &str, value: &OptionValue) -> Result<i64, ConfigError> {
    match value {
        OptionValue::Int(i) => Ok(*i),
        OptionValue::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        OptionValue::Str(s) => s
            .trim()
            .parse()
            .map_err(|e| invalid(option, format!("{e}"))),
        other => Err(invalid(option, format!("expected an integer, got {other}"))),
    }
}

fn to_float(option: &str, value: &OptionValue) -> Result<f64, ConfigError> {
    match value {
        OptionValue::Float(f) => Ok(*f),
        OptionValue::Int(i) => Ok(*i as f64),
        OptionValue::Str(s) => s
            .trim()
            .parse()
            .map_err(|e| invalid(option, format!("{e}"))),
        other => Err(invalid(option, format!("expected a number, got {other}"))),
    }
}

fn to_bool(option: &str, value: &OptionValue) -> Result<bool, ConfigError> {
    match value {
        OptionValue::Bool(b) => Ok(*b),
        OptionValue::Int(0) => Ok(false),
        OptionValue::Int(1) => Ok(true),
        OptionValue::Str(s) => match s.trim() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
            other => Err(invalid(option, format!("expected a boolean, got {other:?}"))),
        },
        other => Err(invalid(option, format!("expected a boolean, got {other}"))),
    }
}

fn to_string(option: &str, value: &OptionValue) -> Result<String, ConfigError> {
    match value {
        OptionValue::Str(s) => Ok(s.clone()),
        other => Err(invalid(option, format!("expected a string, got {other}"))),
    }
}

/// Parses `"300ms"`, `"1.5s"`, `"1m30s"`, `"2h"`. A bare integer is
/// taken as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|e| format!("invalid duration {input:?}: {e}"))
}
