//! Credential references and their resolution.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ReplError, Result};

/// Secret access key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the secret for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// Key pair plus optional addressing, as stored in a credential parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: SecretKey,
    /// Region the keys belong to.
    #[serde(default, alias = "region_name")]
    pub region: Option<String>,
    /// Endpoint override.
    #[serde(default, alias = "endpoint_url")]
    pub endpoint: Option<String>,
}

/// How a store client authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Unsigned requests against a public bucket.
    Anonymous,
    /// The role of the account the pipeline runs in.
    Implicit,
    /// Explicit keys from the credential store.
    Static(StaticCredentials),
}

impl Credentials {
    /// Short mode name for logging.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Implicit => "implicit",
            Self::Static(_) => "static",
        }
    }
}

/// Resolves named credential references.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up `reference`; unknown names are a [`ReplError::Credential`].
    async fn resolve(&self, reference: &str) -> Result<Credentials>;
}

/// Credential store backed by JSON parameter values held in memory.
#[derive(Default)]
pub struct StaticCredentialStore {
    entries: HashMap<String, StaticCredentials>,
}

impl StaticCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter value such as
    /// `{"access_key_id": "..", "secret_access_key": "..", "region_name": ".."}`.
    pub fn insert_json(&mut self, name: &str, value: &str) -> Result<()> {
        let creds: StaticCredentials = serde_json::from_str(value)?;
        self.entries.insert(name.to_string(), creds);
        Ok(())
    }

    /// Number of registered references.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn resolve(&self, reference: &str) -> Result<Credentials> {
        self.entries
            .get(reference)
            .cloned()
            .map(Credentials::Static)
            .ok_or_else(|| ReplError::Credential {
                name: reference.to_string(),
            })
    }
}

/// Resolve the credentials for one side of the pipeline.
///
/// A bucket in the current account uses the implicit role; otherwise an
/// empty reference means anonymous access and a named one is looked up.
pub async fn resolve_for(
    store: &dyn CredentialStore,
    reference: &str,
    in_current_account: bool,
) -> Result<Credentials> {
    let creds = if in_current_account {
        Credentials::Implicit
    } else if reference.is_empty() {
        Credentials::Anonymous
    } else {
        store.resolve(reference).await?
    };
    debug!(reference = reference, mode = creds.mode(), "resolved credentials");
    Ok(creds)
}
