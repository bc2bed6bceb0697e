//! Engine-wide settings.

use ingress_firewall::FirewallSettings;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Overrides the firewall's reconfiguration delay, in milliseconds.
pub const RECONFIGURATION_DELAY_VAR: &str = "INGRESS_RECONFIGURATION_DELAY_MS";

/// Overrides the number of network worker threads.
pub const WORKER_THREADS_VAR: &str = "INGRESS_WORKER_THREADS";

/// Settings of one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub firewall: FirewallSettings,

    /// Engines start paused so that several instances of one document can
    /// coexist until one of them is started.
    pub start_paused: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            firewall: FirewallSettings::default(),
            start_paused: true,
        }
    }
}

impl EngineSettings {
    /// Defaults, with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(delay) = parse_var(&lookup, RECONFIGURATION_DELAY_VAR) {
            self.firewall.reconfiguration_delay_ms = delay;
        }
        if let Some(threads) = parse_var::<usize>(&lookup, WORKER_THREADS_VAR) {
            self.firewall.worker_threads = threads.max(1);
        }
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value '{raw}' of {name}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_start_paused() {
        let settings = EngineSettings::default();
        assert!(settings.start_paused);
        assert_eq!(settings.firewall, FirewallSettings::default());
    }

    #[test]
    fn overrides_apply() {
        let settings = EngineSettings::default().with_overrides(lookup(&[
            (RECONFIGURATION_DELAY_VAR, "25"),
            (WORKER_THREADS_VAR, "0"),
        ]));
        assert_eq!(settings.firewall.reconfiguration_delay_ms, 25);
        assert_eq!(settings.firewall.worker_threads, 1);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let settings =
            EngineSettings::default().with_overrides(lookup(&[(RECONFIGURATION_DELAY_VAR, "soon")]));
        assert_eq!(
            settings.firewall.reconfiguration_delay_ms,
            FirewallSettings::DEFAULT_RECONFIGURATION_DELAY_MS
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"firewall": {"reconfigurationDelayMs": 10}}"#).unwrap();
        assert!(settings.start_paused);
        assert_eq!(settings.firewall.reconfiguration_delay_ms, 10);
        assert_eq!(settings.firewall.accept_backoff_ms, 50);
    }
}
