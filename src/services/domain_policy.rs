// Domain Policy
// Per-domain enable / disable / pause rules consulted once per guard evaluation

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::models::DomainRule;
use crate::services::config_store::ConfigStore;

/// Canonical host for a domain or URL: lowercase, no scheme, path, port,
/// credentials or leading `www.`
pub fn normalize_domain(input: &str) -> String {
    let mut host = input.trim().to_lowercase();
    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    if let Some(idx) = host.find(|c| c == '/' || c == '?' || c == '#') {
        host.truncate(idx);
    }
    if let Some(idx) = host.rfind('@') {
        host = host[idx + 1..].to_string();
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }
    let host = host.trim_end_matches('.');
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

/// `a.b.example.com` -> [`a.b.example.com`, `b.example.com`, `example.com`]
fn lookup_chain(domain: &str) -> Vec<&str> {
    let mut chain = vec![domain];
    let mut rest = domain;
    while let Some(idx) = rest.find('.') {
        rest = &rest[idx + 1..];
        if !rest.contains('.') {
            break;
        }
        chain.push(rest);
    }
    chain
}

pub struct DomainPolicy {
    rules: RwLock<HashMap<String, DomainRule>>,
    persistence: Option<Arc<ConfigStore>>,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DomainPolicy {
    pub fn in_memory() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    /// Unreadable storage degrades to no rules, i.e. the guard stays enabled
    pub fn with_persistence(store: Arc<ConfigStore>) -> Self {
        let stored = match store.load_domain_rules() {
            Ok(rules) => rules,
            Err(e) => {
                warn!("[domain_policy] Failed to load domain rules, guard stays enabled: {}", e);
                Vec::new()
            }
        };
        let rules: HashMap<String, DomainRule> = stored
            .into_iter()
            .filter_map(|mut rule| {
                let domain = normalize_domain(&rule.domain);
                if domain.is_empty() {
                    return None;
                }
                rule.domain = domain.clone();
                Some((domain, rule))
            })
            .collect();
        info!("[domain_policy] Loaded {} domain rules", rules.len());
        Self {
            rules: RwLock::new(rules),
            persistence: Some(store),
        }
    }

    pub fn get(&self, domain: &str) -> Option<DomainRule> {
        let key = normalize_domain(domain);
        self.read(|rules| rules.get(&key).cloned())
    }

    pub fn list(&self) -> Vec<DomainRule> {
        let mut rules = self.read(|rules| rules.values().cloned().collect::<Vec<_>>());
        rules.sort_by(|a, b| a.domain.cmp(&b.domain));
        rules
    }

    /// Upsert a rule; the domain is normalized and `updated_at` stamped
    pub fn set(&self, mut rule: DomainRule, now: DateTime<Utc>) -> Option<DomainRule> {
        let key = normalize_domain(&rule.domain);
        if key.is_empty() {
            return None;
        }
        rule.domain = key.clone();
        rule.updated_at = now;
        self.write(|rules| {
            rules.insert(key, rule.clone());
        });
        Some(rule)
    }

    pub fn remove(&self, domain: &str) -> bool {
        let key = normalize_domain(domain);
        let removed = self.write(|rules| rules.remove(&key).is_some());
        if removed {
            info!("[domain_policy] Removed rule for {}", key);
        }
        removed
    }

    /// Flip `enabled`; a missing rule counts as enabled. Returns the new state.
    pub fn toggle(&self, domain: &str, now: DateTime<Utc>) -> Option<bool> {
        self.update(domain, now, |rule| rule.enabled = !rule.enabled)
            .map(|rule| rule.enabled)
    }

    pub fn set_enabled(&self, domain: &str, enabled: bool, now: DateTime<Utc>) -> Option<DomainRule> {
        self.update(domain, now, |rule| rule.enabled = enabled)
    }

    /// None for an invalid domain or a pause end past the representable range
    pub fn pause(&self, domain: &str, duration: Duration, now: DateTime<Utc>) -> Option<DomainRule> {
        let Some(until) = now.checked_add_signed(duration) else {
            warn!("[domain_policy] Pause of {} out of range", domain);
            return None;
        };
        self.update(domain, now, |rule| rule.pause_until = Some(until))
    }

    pub fn resume(&self, domain: &str, now: DateTime<Utc>) -> Option<DomainRule> {
        self.update(domain, now, |rule| rule.pause_until = None)
    }

    /// The most specific rule (the host itself, then its parents) decides.
    /// No rule means the guard is active.
    pub fn is_guard_active(&self, domain: &str, now: DateTime<Utc>) -> bool {
        let key = normalize_domain(domain);
        if key.is_empty() {
            return true;
        }
        self.read(|rules| {
            lookup_chain(&key)
                .into_iter()
                .find_map(|candidate| rules.get(candidate))
                .map_or(true, |rule| !rule.disables_guard(now))
        })
    }

    fn update<F>(&self, domain: &str, now: DateTime<Utc>, f: F) -> Option<DomainRule>
    where
        F: FnOnce(&mut DomainRule),
    {
        let key = normalize_domain(domain);
        if key.is_empty() {
            return None;
        }
        let rule = self.write(|rules| {
            let rule = rules
                .entry(key.clone())
                .or_insert_with(|| DomainRule::new(&key, now));
            f(rule);
            rule.updated_at = now;
            rule.clone()
        });
        info!(
            "[domain_policy] {} enabled={} paused={}",
            rule.domain,
            rule.enabled,
            rule.is_paused(now)
        );
        Some(rule)
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, DomainRule>) -> T) -> T {
        match self.rules.read() {
            Ok(rules) => f(&rules),
            Err(e) => f(&e.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, DomainRule>) -> T) -> T {
        let (value, snapshot) = {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            let value = f(&mut rules);
            let snapshot: Vec<DomainRule> = rules.values().cloned().collect();
            (value, snapshot)
        };
        if let Some(store) = &self.persistence {
            if let Err(e) = store.save_domain_rules(&snapshot) {
                warn!("[domain_policy] Failed to persist domain rules: {}", e);
            }
        }
        value
    }
}
