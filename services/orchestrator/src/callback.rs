//! Workspace callback credentials.
//!
//! A token is `{workspace_id}.{expires_unix}.{hex hmac-sha256}` signed over
//! the first two parts. Workspaces present it as a bearer token when they
//! report readiness or a provisioning failure.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sam_id::WorkspaceId;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackTokenError {
    #[error("malformed callback token")]
    Malformed,

    #[error("callback token was issued for another workspace")]
    WrongWorkspace,

    #[error("callback token expired")]
    Expired,

    #[error("callback token signature mismatch")]
    BadSignature,

    #[error("callback signing key rejected")]
    InvalidKey,
}

#[derive(Clone)]
pub struct CallbackSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for CallbackSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSigner").finish_non_exhaustive()
    }
}

impl CallbackSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256, CallbackTokenError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| CallbackTokenError::InvalidKey)?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    /// Mints a token for `workspace_id` valid until `expires_at`.
    pub fn mint(
        &self,
        workspace_id: WorkspaceId,
        expires_at: DateTime<Utc>,
    ) -> Result<String, CallbackTokenError> {
        let payload = format!("{}.{}", workspace_id, expires_at.timestamp());
        let signature = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Checks a token against the workspace it claims to be for.
    pub fn verify(
        &self,
        token: &str,
        workspace_id: WorkspaceId,
        now: DateTime<Utc>,
    ) -> Result<(), CallbackTokenError> {
        let mut parts = token.rsplitn(2, '.');
        let (Some(signature), Some(payload)) = (parts.next(), parts.next()) else {
            return Err(CallbackTokenError::Malformed);
        };
        let (subject, expires) = payload
            .split_once('.')
            .ok_or(CallbackTokenError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| CallbackTokenError::Malformed)?;

        self.mac(payload)?
            .verify_slice(&signature)
            .map_err(|_| CallbackTokenError::BadSignature)?;

        if subject != workspace_id.to_string() {
            return Err(CallbackTokenError::WrongWorkspace);
        }

        let expires_at = expires
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or(CallbackTokenError::Malformed)?;
        if now >= expires_at {
            return Err(CallbackTokenError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_mint_then_verify() {
        let signer = CallbackSigner::new("secret");
        let workspace = WorkspaceId::new();
        let now = Utc::now();
        let token = signer.mint(workspace, now + Duration::hours(1)).unwrap();
        assert_eq!(signer.verify(&token, workspace, now), Ok(()));
    }

    #[test]
    fn test_rejections() {
        let signer = CallbackSigner::new("secret");
        let workspace = WorkspaceId::new();
        let now = Utc::now();
        let token = signer.mint(workspace, now + Duration::hours(1)).unwrap();

        assert_eq!(
            signer.verify(&token, WorkspaceId::new(), now),
            Err(CallbackTokenError::WrongWorkspace)
        );
        assert_eq!(
            signer.verify(&token, workspace, now + Duration::hours(2)),
            Err(CallbackTokenError::Expired)
        );
        assert_eq!(
            CallbackSigner::new("other").verify(&token, workspace, now),
            Err(CallbackTokenError::BadSignature)
        );
        assert_eq!(
            signer.verify("no-dots", workspace, now),
            Err(CallbackTokenError::Malformed)
        );

        let tampered = token.replacen(&workspace.to_string(), &WorkspaceId::new().to_string(), 1);
        assert_eq!(
            signer.verify(&tampered, workspace, now),
            Err(CallbackTokenError::BadSignature)
        );
    }
}
