//! Process-wide knobs read from `KREADY_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// How the observer obtains snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Watch,
    Poll,
    /// Watch first; fall back to polling once watch retries are exhausted.
    Auto,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "watch" => Ok(Transport::Watch),
            "poll" => Ok(Transport::Poll),
            "auto" => Ok(Transport::Auto),
            other => Err(format!("unknown transport: {other} (expect watch|poll|auto)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub kube_qps: f64,
    pub kube_burst: u32,
    pub transport: Transport,
    pub poll_interval: Duration,
    pub watch_backoff_max: Duration,
    pub observer_max_retries: u32,
    pub queue_cap: usize,
    pub service_settle: Duration,
    pub await_all: bool,
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kube_qps: 20.0,
            kube_burst: 40,
            transport: Transport::Auto,
            poll_interval: Duration::from_millis(2000),
            watch_backoff_max: Duration::from_secs(30),
            observer_max_retries: 8,
            queue_cap: 256,
            service_settle: Duration::from_secs(10),
            await_all: false,
            metrics_addr: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`Settings::from_env`] over an arbitrary lookup. Unset or empty
    /// variables keep their defaults; set ones must parse and fit.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let d = Self::default();
        let var = |k: &str| get(k).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let bad = |k: &str, v: &str, reason: String| CoreError::InvalidSetting { var: k.to_string(), value: v.to_string(), reason };
        let num = |k: &str| -> Result<Option<u64>, CoreError> {
            var(k).map(|v| v.parse::<u64>().map_err(|e| bad(k, &v, e.to_string()))).transpose()
        };
        let small = |k: &str| -> Result<Option<u32>, CoreError> {
            num(k)?.map(|n| u32::try_from(n).map_err(|e| bad(k, &n.to_string(), e.to_string()))).transpose()
        };
        let kube_qps = match var("KREADY_KUBE_QPS") {
            Some(v) => match v.parse::<f64>() {
                Ok(q) if q > 0.0 && q.is_finite() => q,
                Ok(_) => return Err(bad("KREADY_KUBE_QPS", &v, "must be a positive number".into())),
                Err(e) => return Err(bad("KREADY_KUBE_QPS", &v, e.to_string())),
            },
            None => d.kube_qps,
        };
        let transport = match var("KREADY_TRANSPORT") {
            Some(v) => v.parse().map_err(|e| bad("KREADY_TRANSPORT", &v, e))?,
            None => d.transport,
        };
        let queue_cap = match num("KREADY_QUEUE_CAP")? {
            Some(n) => usize::try_from(n).map_err(|e| bad("KREADY_QUEUE_CAP", &n.to_string(), e.to_string()))?.max(1),
            None => d.queue_cap,
        };
        Ok(Self {
            kube_qps,
            kube_burst: small("KREADY_KUBE_BURST")?.map(|b| b.max(1)).unwrap_or(d.kube_burst),
            transport,
            poll_interval: num("KREADY_POLL_INTERVAL_MS")?.map(Duration::from_millis).unwrap_or(d.poll_interval),
            watch_backoff_max: num("KREADY_WATCH_BACKOFF_MAX_SECS")?.map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            observer_max_retries: small("KREADY_OBSERVER_MAX_RETRIES")?.unwrap_or(d.observer_max_retries),
            queue_cap,
            service_settle: num("KREADY_SERVICE_SETTLE_SECS")?.map(Duration::from_secs).unwrap_or(d.service_settle),
            await_all: var("KREADY_AWAIT_ALL").map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(d.await_all),
            metrics_addr: var("KREADY_METRICS_ADDR"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_and_falls_back() {
        let env: HashMap<&str, &str> = [
            ("KREADY_KUBE_QPS", "5.5"),
            ("KREADY_TRANSPORT", "Poll"),
            ("KREADY_SERVICE_SETTLE_SECS", "0"),
            ("KREADY_AWAIT_ALL", "true"),
            ("KREADY_QUEUE_CAP", " "),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.kube_qps, 5.5);
        assert_eq!(s.transport, Transport::Poll);
        assert_eq!(s.service_settle, Duration::ZERO);
        assert!(s.await_all);
        assert_eq!(s.queue_cap, 256);
        assert_eq!(s.metrics_addr, None);
    }

    #[test]
    fn invalid_values_are_reported_not_truncated() {
        let one = |k: &'static str, v: &'static str| Settings::from_lookup(move |q| (q == k).then(|| v.to_string()));
        match one("KREADY_KUBE_BURST", "4294967296") {
            Err(CoreError::InvalidSetting { var, value, .. }) => {
                assert_eq!(var, "KREADY_KUBE_BURST");
                assert_eq!(value, "4294967296");
            }
            other => panic!("expected an error, got {other:?}"),
        }
        assert!(one("KREADY_OBSERVER_MAX_RETRIES", "5000000000").is_err());
        assert!(one("KREADY_QUEUE_CAP", "nope").is_err());
        assert!(one("KREADY_KUBE_QPS", "-1").is_err());
        assert!(one("KREADY_TRANSPORT", "carrier-pigeon").is_err());
        assert_eq!(one("KREADY_KUBE_BURST", "4294967295").unwrap().kube_burst, u32::MAX);
    }
}
