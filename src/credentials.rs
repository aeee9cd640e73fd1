use anyhow::Result;
use parking_lot::RwLock;

/// Access/refresh token pair as last persisted.
///
/// Both present means signed in, both absent means signed out. A half-filled
/// pair only shows up while a refresh is rewriting the tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    /// Access token suitable for a bearer header: present and non-blank.
    pub fn bearer(&self) -> Option<&str> {
        non_blank(self.access_token.as_deref())
    }

    pub fn refresh(&self) -> Option<&str> {
        non_blank(self.refresh_token.as_deref())
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer().is_some() && self.refresh().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Durable storage for the credential pair.
///
/// Reads are expected to be fast and are taken without any pipeline lock.
/// Writes happen at login/logout or inside a refresh episode.
pub trait CredentialStore: Send + Sync {
    fn read(&self) -> Result<Credentials>;
    fn write_access_token(&self, token: &str) -> Result<()>;
    fn write_refresh_token(&self, token: &str) -> Result<()>;
    /// Replace both tokens in one write.
    fn write_pair(&self, access_token: &str, refresh_token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Process-local store. Used for ephemeral sessions and as a test double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Credentials>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(creds: Credentials) -> Self {
        Self {
            inner: RwLock::new(creds),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn read(&self) -> Result<Credentials> {
        Ok(self.inner.read().clone())
    }

    fn write_access_token(&self, token: &str) -> Result<()> {
        self.inner.write().access_token = Some(token.to_string());
        Ok(())
    }

    fn write_refresh_token(&self, token: &str) -> Result<()> {
        self.inner.write().refresh_token = Some(token.to_string());
        Ok(())
    }

    fn write_pair(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        *self.inner.write() = Credentials::new(access_token, refresh_token);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.inner.write() = Credentials::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_access_token_is_not_a_bearer() {
        let creds = Credentials {
            access_token: Some("   ".into()),
            refresh_token: Some("r1".into()),
        };
        assert_eq!(creds.bearer(), None);
        assert!(!creds.is_authenticated());
    }

    #[test]
    fn memory_store_pair_and_clear() {
        let store = MemoryStore::new();
        assert!(store.read().unwrap().is_empty());

        store.write_pair("a1", "r1").unwrap();
        assert_eq!(store.read().unwrap(), Credentials::new("a1", "r1"));

        store.write_access_token("a2").unwrap();
        let creds = store.read().unwrap();
        assert_eq!(creds.bearer(), Some("a2"));
        assert_eq!(creds.refresh(), Some("r1"));

        store.clear().unwrap();
        assert!(store.read().unwrap().is_empty());
    }
}
