use async_trait::async_trait;
use subtle::ConstantTimeEq;

/// Login check. User storage lives outside this crate; implementations
/// return the principal id for valid credentials.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> anyhow::Result<Option<String>>;
}

/// Single operator account from configuration.
#[derive(Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
    principal_id: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .field("principal_id", &self.principal_id)
            .finish_non_exhaustive()
    }
}

impl StaticCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        principal_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            principal_id: principal_id.into(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> anyhow::Result<Option<String>> {
        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        if (user_ok & pass_ok).unwrap_u8() == 1 {
            Ok(Some(self.principal_id.clone()))
        } else {
            Ok(None)
        }
    }
}
