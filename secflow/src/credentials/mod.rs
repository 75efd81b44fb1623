//! Named secret resolution with scoped lifetime and output redaction.
//!
//! Stages ask the [`CredentialBroker`] for the secrets they need as a
//! [`CredentialScope`]. Secret values stay inside [`SecretString`] and are
//! only exposed at the point of use (an HTTP header, a child process
//! environment). Everything a stage captures from a tool passes through
//! [`CredentialBroker::redact`] before it is stored or logged.

use crate::errors::CredentialError;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Replacement text for redacted secret values.
pub const REDACTED: &str = "****";

/// Shortest secret value that is redacted from captured output.
///
/// Shorter values would mangle ordinary text.
const MIN_REDACT_LEN: usize = 4;

/// A source of named secrets.
pub trait SecretSource: Send + Sync + Debug {
    /// Looks up a secret by name.
    fn lookup(&self, name: &str) -> Option<SecretString>;
}

/// Reads secrets from process environment variables.
///
/// A secret named `tracker-token` with prefix `SECFLOW_SECRET_` is read
/// from `SECFLOW_SECRET_TRACKER_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    prefix: String,
}

impl EnvSecretSource {
    /// Creates a source reading variables with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the environment variable consulted for a secret name.
    #[must_use]
    pub fn variable_for(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new("SECFLOW_SECRET_")
    }
}

impl SecretSource for EnvSecretSource {
    fn lookup(&self, name: &str) -> Option<SecretString> {
        std::env::var(self.variable_for(name))
            .ok()
            .map(SecretString::from)
    }
}

/// An in-memory secret map, for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticSecretSource {
    secrets: HashMap<String, SecretString>,
}

impl StaticSecretSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .insert(name.into(), SecretString::from(value.into()));
        self
    }
}

impl SecretSource for StaticSecretSource {
    fn lookup(&self, name: &str) -> Option<SecretString> {
        self.secrets
            .get(name)
            .map(|s| SecretString::from(s.expose_secret().to_string()))
    }
}

/// A resolved secret.
pub struct Credential {
    name: String,
    value: SecretString,
}

impl Credential {
    /// Returns the secret's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the secret value.
    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    /// Exposes the cleartext value at the point of use.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("value", &REDACTED)
            .finish()
    }
}

/// Secrets acquired for one stage block.
///
/// Dropping the scope drops the values; the broker keeps redacting them
/// from later output.
#[derive(Debug, Default)]
pub struct CredentialScope {
    credentials: Vec<Credential>,
}

impl CredentialScope {
    /// Returns a credential by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.name == name)
    }

    /// Returns the number of credentials in scope.
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Returns true if the scope holds no credentials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Iterates the credentials in scope.
    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }
}

/// Resolves named secrets for stages and redacts them from output.
#[derive(Debug)]
pub struct CredentialBroker {
    source: Arc<dyn SecretSource>,
    issued: RwLock<Vec<SecretString>>,
}

impl CredentialBroker {
    /// Creates a broker over a secret source.
    #[must_use]
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        Self {
            source,
            issued: RwLock::new(Vec::new()),
        }
    }

    /// Resolves a single secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is unknown or empty.
    pub fn resolve(&self, name: &str) -> Result<Credential, CredentialError> {
        let value = self
            .source
            .lookup(name)
            .ok_or_else(|| CredentialError::Unknown {
                name: name.to_string(),
            })?;

        if value.expose_secret().is_empty() {
            return Err(CredentialError::Empty {
                name: name.to_string(),
            });
        }

        self.remember(&value);
        debug!(secret = %name, "Resolved credential");

        Ok(Credential {
            name: name.to_string(),
            value,
        })
    }

    /// Resolves every named secret into one scope.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error; nothing is issued in that case.
    pub fn scope<S: AsRef<str>>(&self, names: &[S]) -> Result<CredentialScope, CredentialError> {
        let credentials = names
            .iter()
            .map(|n| self.resolve(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CredentialScope { credentials })
    }

    /// Replaces every secret value issued so far with [`REDACTED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let issued = self.issued.read();
        let mut out = text.to_string();
        for secret in issued.iter() {
            let value = secret.expose_secret();
            if value.len() >= MIN_REDACT_LEN && out.contains(value) {
                out = out.replace(value, REDACTED);
            }
        }
        out
    }

    fn remember(&self, value: &SecretString) {
        let mut issued = self.issued.write();
        if !issued
            .iter()
            .any(|s| s.expose_secret() == value.expose_secret())
        {
            issued.push(SecretString::from(value.expose_secret().to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> CredentialBroker {
        CredentialBroker::new(Arc::new(
            StaticSecretSource::new()
                .with("tracker-token", "tok-123456")
                .with("empty", ""),
        ))
    }

    #[test]
    fn test_resolve_and_expose() {
        let b = broker();
        let cred = b.resolve("tracker-token").unwrap();
        assert_eq!(cred.name(), "tracker-token");
        assert_eq!(cred.expose(), "tok-123456");
    }

    #[test]
    fn test_unknown_and_empty() {
        let b = broker();
        assert!(matches!(
            b.resolve("missing"),
            Err(CredentialError::Unknown { .. })
        ));
        assert!(matches!(
            b.resolve("empty"),
            Err(CredentialError::Empty { .. })
        ));
    }

    #[test]
    fn test_scope_all_or_nothing() {
        let b = broker();
        assert!(b.scope(&["tracker-token", "missing"]).is_err());

        let scope = b.scope(&["tracker-token"]).unwrap();
        assert_eq!(scope.len(), 1);
        assert!(scope.get("tracker-token").is_some());
        assert!(scope.get("other").is_none());
    }

    #[test]
    fn test_debug_never_prints_value() {
        let b = broker();
        let cred = b.resolve("tracker-token").unwrap();
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("tok-123456"));
        assert!(rendered.contains(REDACTED));
    }

    #[test]
    fn test_redact_issued_values() {
        let b = broker();
        assert_eq!(b.redact("token tok-123456"), "token tok-123456");

        let scope = b.scope(&["tracker-token"]).unwrap();
        drop(scope);
        assert_eq!(
            b.redact("Authorization: Bearer tok-123456"),
            "Authorization: Bearer ****"
        );
    }

    #[test]
    fn test_env_source_variable_name() {
        let source = EnvSecretSource::default();
        assert_eq!(
            source.variable_for("tracker-token"),
            "SECFLOW_SECRET_TRACKER_TOKEN"
        );
        assert!(source.lookup("definitely-not-set-anywhere-xyz").is_none());
    }
}
