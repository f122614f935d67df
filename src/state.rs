//! The service dependency record.
//!
//! Everything is constructed once at boot and passed through this
//! struct explicitly. No subsystem is reachable through a module global.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::classify::Classifier;
use crate::clock::Clock;
use crate::config::{Features, Policy, Secrets};
use crate::db::Store;
use crate::digest::links::LinkBuilder;
use crate::limiter::{CircuitBreaker, RateLimiter};
use crate::llm::adapter::LlmAdapter;
use crate::llm::LlmProvider;
use crate::types::DigestResponse;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ServiceState {
    pub policy: Arc<Policy>,
    pub features: Arc<Features>,
    pub secrets: Secrets,
    pub store: Arc<Store>,
    pub limiter: RateLimiter,
    pub adapter: Arc<LlmAdapter>,
    pub classifier: Classifier,
    pub clock: Clock,
    pub links: LinkBuilder,
    /// Concurrent digest requests for the same `(user, session)` coalesce
    /// onto one execution through these cells.
    pub digest_flights: DashMap<String, Arc<OnceCell<DigestResponse>>>,
    pub trusted_proxies: HashSet<IpAddr>,
}

impl ServiceState {
    pub fn new(
        policy: Policy,
        secrets: Secrets,
        store: Arc<Store>,
        provider: Arc<dyn LlmProvider>,
        clock: Clock,
    ) -> Self {
        let policy = Arc::new(policy);
        let features = Arc::new(Features::new());
        let breaker = Arc::new(CircuitBreaker::new(&policy));
        let adapter = Arc::new(LlmAdapter::new(provider, breaker));
        let classifier = Classifier::new(
            store.clone(),
            adapter.clone(),
            policy.clone(),
            features.clone(),
        );
        let limiter = RateLimiter::new(&policy);
        let links = LinkBuilder::new(
            std::env::var("INBOXOS_MAIL_BASE")
                .unwrap_or_else(|_| "https://mail.example.com".to_string()),
        );
        let trusted_proxies = std::env::var("INBOXOS_TRUSTED_PROXIES")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        Self {
            policy,
            features,
            secrets,
            store,
            limiter,
            adapter,
            classifier,
            clock,
            links,
            digest_flights: DashMap::new(),
            trusted_proxies,
        }
    }

    /// Stage collaborators for the digest pipeline.
    pub fn stage_deps(&self) -> crate::digest::pipeline::StageDeps {
        crate::digest::pipeline::StageDeps {
            adapter: Some(self.adapter.clone()),
            features: self.features.clone(),
            greeting_source: None,
            links: self.links.clone(),
        }
    }
}
