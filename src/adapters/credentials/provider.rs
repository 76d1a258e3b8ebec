use crate::domain::{AuthRule, AuthenticatorId, ConnectError, Credentials, Result};
use crate::ports::CredentialsPort;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(size) => size,
    None => panic!("cache size must be non-zero"),
};

/// Proxy credentials from configured rules, matched on the proxy host name
/// or any of its parent domains.
pub struct CredentialProvider {
    identity: AuthenticatorId,
    rules: Arc<RwLock<HashMap<String, (String, String)>>>,
    cache: Arc<RwLock<LruCache<String, Option<Credentials>>>>,
}

impl CredentialProvider {
    pub fn new(auth_rules: Vec<AuthRule>) -> Result<Self> {
        let mut rules_map = HashMap::new();

        for rule in auth_rules {
            // Password commands run once, at startup.
            let password = Self::execute_password_command(&rule.password_command)?;
            if password.is_empty() {
                log::error!("Password command for {} returned an empty password.", rule.remote_pattern);
                return Err(ConnectError::Configuration(format!(
                    "empty password for {}",
                    rule.remote_pattern
                )));
            }
            rules_map.insert(rule.remote_pattern.to_ascii_lowercase(), (rule.username, password));
        }

        let identity = if rules_map.is_empty() {
            AuthenticatorId::anonymous()
        } else {
            AuthenticatorId(format!("rules-{}", Uuid::new_v4()))
        };

        Ok(Self {
            identity,
            rules: Arc::new(RwLock::new(rules_map)),
            cache: Arc::new(RwLock::new(LruCache::new(CACHE_SIZE))),
        })
    }

    fn execute_password_command(cmd: &str) -> Result<String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|e| ConnectError::Configuration(format!("Password command failed: {}", e)))?;

        String::from_utf8(output.stdout)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| ConnectError::Configuration(format!("Invalid UTF-8 from password command: {}", e)))
    }

    async fn find_credentials_for_host(&self, host: &str) -> Option<Credentials> {
        let rules = self.rules.read().await;
        let mut candidate = host.to_ascii_lowercase();

        loop {
            if candidate.is_empty() {
                return None;
            }
            if let Some((username, password)) = rules.get(&candidate) {
                log::debug!("Found credentials for proxy {} under {}: {}", host, candidate, username);
                return Some(Credentials::new(username.clone(), password.clone()));
            }
            // Drop the leftmost label, keeping the leading dot: proxy.corp.example -> .corp.example
            let rest = candidate.trim_start_matches('.');
            match rest.find('.') {
                Some(dot) => candidate = rest[dot..].to_string(),
                None => return None,
            }
        }
    }
}

#[async_trait]
impl CredentialsPort for CredentialProvider {
    fn identity(&self) -> AuthenticatorId {
        self.identity.clone()
    }

    async fn get_credentials(&self, host: &str) -> Result<Option<Credentials>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(host) {
                return Ok(cached.clone());
            }
        }

        let creds = self.find_credentials_for_host(host).await;

        {
            let mut cache = self.cache.write().await;
            cache.put(host.to_string(), creds.clone());
        }
        Ok(creds)
    }

    async fn clear_cache(&self) -> Result<()> {
        let mut cache = self.cache.write().await;
        cache.clear();
        Ok(())
    }
}
