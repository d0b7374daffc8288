//! Scoped injection of host secrets into sub-server environments.
//!
//! A secret is only handed to the servers named in its allow-list; nothing
//! is broadcast to every sub-server.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::Deserialize;

/// One allow-listed secret as written in the host config.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScopedSecret {
    /// Variable name inside the sub-server.
    pub env: String,
    /// Host variable holding the value; defaults to `env`.
    #[serde(default)]
    pub from_env: Option<String>,
    /// Server names allowed to receive this secret.
    pub servers: Vec<String>,
}

#[derive(Debug, Clone)]
struct ResolvedSecret {
    env: String,
    value: String,
    servers: Vec<String>,
}

/// Resolved secrets plus the servers each one is scoped to.
#[derive(Debug, Clone, Default)]
pub struct SecretPolicy {
    secrets: Vec<ResolvedSecret>,
}

impl SecretPolicy {
    /// A policy that injects nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve configured secrets through `lookup` (normally the host env).
    ///
    /// Secrets whose source variable is unset are skipped with a warning.
    pub fn resolve<F>(entries: &[ScopedSecret], lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut secrets = Vec::new();
        for entry in entries {
            let source = entry.from_env.as_deref().unwrap_or(&entry.env);
            match lookup(source) {
                Some(value) => secrets.push(ResolvedSecret {
                    env: entry.env.clone(),
                    value,
                    servers: entry.servers.clone(),
                }),
                None => {
                    tracing::warn!(
                        env = %entry.env,
                        source,
                        "secret source variable not set, skipping"
                    );
                }
            }
        }
        Self { secrets }
    }

    /// Resolve against the host process environment.
    pub fn from_host_env(entries: &[ScopedSecret]) -> Self {
        Self::resolve(entries, |key| std::env::var(key).ok())
    }

    /// Merge caller-supplied `env` with the secrets scoped to `server_name`.
    ///
    /// Caller values win on key clash.
    pub fn environment_for(
        &self,
        server_name: &str,
        mut env: HashMap<String, String>,
    ) -> HashMap<String, String> {
        for name in self.inject(server_name, &mut env) {
            tracing::debug!(server = server_name, env = name, "injecting scoped secret");
        }
        env
    }

    /// Insert the secrets scoped to `server_name` that `env` does not set yet.
    ///
    /// Returns the names actually inserted.
    fn inject(&self, server_name: &str, env: &mut HashMap<String, String>) -> Vec<&str> {
        let mut injected = Vec::new();
        for secret in self
            .secrets
            .iter()
            .filter(|s| s.servers.iter().any(|name| name == server_name))
        {
            match env.entry(secret.env.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(secret.value.clone());
                    injected.push(secret.env.as_str());
                }
                Entry::Occupied(_) => {
                    tracing::debug!(
                        server = server_name,
                        env = %secret.env,
                        "caller env overrides scoped secret"
                    );
                }
            }
        }
        injected
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
