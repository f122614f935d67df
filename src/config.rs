//! Policy, secrets, and feature gates.
//!
//! The policy YAML is authoritative for thresholds. Secrets come from the
//! environment and are validated at startup (production fails closed when
//! the admin key or LLM credentials are unset). Feature gates are a
//! read-mostly override table on the process, consulted per request:
//! runtime override → environment → compiled default.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Confidence thresholds and admission limits. Unknown keys fail the load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Policy {
    pub min_type_conf: f64,
    pub min_label_conf: f64,
    pub type_gate: f64,
    pub domain_gate: f64,
    pub attention_gate: f64,
    pub learning_min_conf: f64,
    pub verifier_trigger_lo: f64,
    pub verifier_trigger_hi: f64,
    pub verifier_accept_delta: f64,
    pub daily_cost_cap_usd: f64,
    pub emails_per_minute: u32,
    pub emails_per_hour: u32,
    pub requests_per_minute: u32,
    pub max_tracked_ips: usize,
    pub max_batch_emails: usize,
    /// Messages already classified inside this window are served from the
    /// audit table instead of re-running the tiers.
    pub dedupe_window_hours: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_type_conf: 0.70,
            min_label_conf: 0.50,
            type_gate: 0.70,
            domain_gate: 0.50,
            attention_gate: 0.50,
            learning_min_conf: 0.80,
            verifier_trigger_lo: 0.55,
            verifier_trigger_hi: 0.85,
            verifier_accept_delta: 0.15,
            daily_cost_cap_usd: 10.0,
            emails_per_minute: 500,
            emails_per_hour: 5000,
            requests_per_minute: 60,
            max_tracked_ips: 10_000,
            max_batch_emails: 100,
            dedupe_window_hours: 24,
        }
    }
}

impl Policy {
    /// Load and validate a policy document. Missing keys take compiled
    /// defaults; unknown keys or out-of-range values are startup errors.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read policy file {}: {}", path.display(), e))?;
        let policy: Policy = serde_yaml::from_str(&content)
            .map_err(|e| format!("Failed to parse policy file: {}", e))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        let gates = [
            ("min_type_conf", self.min_type_conf),
            ("min_label_conf", self.min_label_conf),
            ("type_gate", self.type_gate),
            ("domain_gate", self.domain_gate),
            ("attention_gate", self.attention_gate),
            ("learning_min_conf", self.learning_min_conf),
            ("verifier_trigger_lo", self.verifier_trigger_lo),
            ("verifier_trigger_hi", self.verifier_trigger_hi),
            ("verifier_accept_delta", self.verifier_accept_delta),
        ];
        for (name, value) in gates {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("policy key {} out of range [0,1]: {}", name, value));
            }
        }
        if self.verifier_trigger_lo > self.verifier_trigger_hi {
            return Err("verifier_trigger_lo exceeds verifier_trigger_hi".to_string());
        }
        if self.emails_per_minute == 0 || self.requests_per_minute == 0 {
            return Err("admission limits must be positive".to_string());
        }
        if self.max_batch_emails == 0 {
            return Err("max_batch_emails must be positive".to_string());
        }
        if self.daily_cost_cap_usd <= 0.0 {
            return Err("daily_cost_cap_usd must be positive".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run environment + secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnv {
    Production,
    Development,
    Test,
}

impl RunEnv {
    pub fn from_env() -> Self {
        match std::env::var("INBOXOS_ENV").as_deref() {
            Ok("production") => RunEnv::Production,
            Ok("test") => RunEnv::Test,
            _ => RunEnv::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunEnv::Production => "production",
            RunEnv::Development => "development",
            RunEnv::Test => "test",
        }
    }
}

/// Secrets read once at boot. Values never appear in logs.
#[derive(Clone)]
pub struct Secrets {
    pub admin_key: Option<String>,
    pub llm_api_key: Option<String>,
    pub caller_key: Option<String>,
    pub env: RunEnv,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            admin_key: std::env::var("INBOXOS_ADMIN_KEY").ok().filter(|s| !s.is_empty()),
            llm_api_key: std::env::var("INBOXOS_LLM_API_KEY").ok().filter(|s| !s.is_empty()),
            caller_key: std::env::var("INBOXOS_CALLER_KEY").ok().filter(|s| !s.is_empty()),
            env: RunEnv::from_env(),
        }
    }

    /// Production fails closed when required secrets are unset.
    pub fn validate(&self) -> Result<(), String> {
        if self.env != RunEnv::Production {
            return Ok(());
        }
        if self.admin_key.is_none() {
            return Err("INBOXOS_ADMIN_KEY is required in production".to_string());
        }
        if self.llm_api_key.is_none() {
            return Err("INBOXOS_LLM_API_KEY is required in production".to_string());
        }
        if self.caller_key.is_none() {
            return Err("INBOXOS_CALLER_KEY is required in production".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<set>"))
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<set>"))
            .field("caller_key", &self.caller_key.as_ref().map(|_| "<set>"))
            .field("env", &self.env.as_str())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Feature gates
// ---------------------------------------------------------------------------

/// Known feature flags and their compiled defaults.
const FEATURE_DEFAULTS: &[(&str, bool)] = &[
    ("verifier", true),
    ("learning", true),
    ("llm_entities", false),
    ("weather_greeting", false),
];

/// Runtime feature overrides. Overrides are ephemeral: they live on this
/// process only and reset on restart.
#[derive(Default)]
pub struct Features {
    overrides: RwLock<HashMap<String, bool>>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known(name: &str) -> bool {
        FEATURE_DEFAULTS.iter().any(|(n, _)| *n == name)
    }

    /// Resolution order: runtime override → env var → compiled default.
    pub fn is_enabled(&self, name: &str) -> bool {
        if let Some(v) = self.overrides.read().get(name) {
            return *v;
        }
        let env_key = format!("INBOXOS_FEATURE_{}", name.to_uppercase());
        if let Ok(v) = std::env::var(&env_key) {
            return v == "1" || v.eq_ignore_ascii_case("true");
        }
        FEATURE_DEFAULTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, d)| *d)
            .unwrap_or(false)
    }

    pub fn set(&self, name: &str, enabled: bool) {
        self.overrides.write().insert(name.to_string(), enabled);
    }

    /// Snapshot of every known flag with its effective value.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        FEATURE_DEFAULTS
            .iter()
            .map(|(n, _)| (n.to_string(), self.is_enabled(n)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_validate() {
        Policy::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn test_policy_rejects_out_of_range_gate() {
        let mut p = Policy::default();
        p.min_type_conf = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_policy_rejects_inverted_verifier_band() {
        let mut p = Policy::default();
        p.verifier_trigger_lo = 0.9;
        p.verifier_trigger_hi = 0.6;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_policy_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "min_type_conf: 0.8\nnot_a_key: 1\n").unwrap();
        assert!(Policy::load(&path).is_err());
    }

    #[test]
    fn test_policy_load_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "min_type_conf: 0.75\nemails_per_minute: 200\n").unwrap();
        let p = Policy::load(&path).expect("load");
        assert_eq!(p.min_type_conf, 0.75);
        assert_eq!(p.emails_per_minute, 200);
        assert_eq!(p.verifier_accept_delta, 0.15); // default
    }

    #[test]
    fn test_features_override_wins() {
        let f = Features::new();
        assert!(f.is_enabled("verifier")); // compiled default
        f.set("verifier", false);
        assert!(!f.is_enabled("verifier"));
        f.set("verifier", true);
        assert!(f.is_enabled("verifier"));
    }

    #[test]
    fn test_features_unknown_flag_defaults_false() {
        let f = Features::new();
        assert!(!f.is_enabled("does_not_exist"));
        assert!(!Features::is_known("does_not_exist"));
        assert!(Features::is_known("learning"));
    }

    #[test]
    fn test_secrets_production_requires_keys() {
        let s = Secrets {
            admin_key: None,
            llm_api_key: Some("k".into()),
            caller_key: Some("c".into()),
            env: RunEnv::Production,
        };
        assert!(s.validate().is_err());

        let dev = Secrets { env: RunEnv::Development, ..s };
        assert!(dev.validate().is_ok());
    }

    #[test]
    fn test_secrets_debug_redacts() {
        let s = Secrets {
            admin_key: Some("super-secret".into()),
            llm_api_key: None,
            caller_key: None,
            env: RunEnv::Development,
        };
        let debug = format!("{:?}", s);
        assert!(!debug.contains("super-secret"));
    }
}
