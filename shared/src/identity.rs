use serde::{Serialize, Deserialize};
use std::fmt;
use uuid::Uuid;

pub const AUTHENTICATED_USER_HEADER: &str = "X-Authenticated-User";
pub const GUEST_TOKEN_HEADER: &str = "X-Guest-Id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Malformed identity key: {0}")]
    InvalidKey(String),
    #[error("Malformed authenticated user id: {0}")]
    InvalidUserId(String),
}

/// Opaque token for one distinct voting party.
///
/// Serialized as its key string (`user:<uuid>` or `guest:<fingerprint>`), which is
/// also the form persisted in storage and compared when checking for duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VoterIdentity {
    User(Uuid),
    Guest(String),
}

impl VoterIdentity {
    pub fn key(&self) -> String {
        match self {
            VoterIdentity::User(id) => format!("user:{id}"),
            VoterIdentity::Guest(fingerprint) => format!("guest:{fingerprint}"),
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, IdentityError> {
        match key.split_once(':') {
            Some(("user", id)) => Uuid::parse_str(id)
                .map(VoterIdentity::User)
                .map_err(|_| IdentityError::InvalidKey(key.to_string())),
            Some(("guest", fingerprint)) if !fingerprint.is_empty() => {
                Ok(VoterIdentity::Guest(fingerprint.to_string()))
            }
            _ => Err(IdentityError::InvalidKey(key.to_string())),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, VoterIdentity::User(_))
    }
}

impl fmt::Display for VoterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<VoterIdentity> for String {
    fn from(identity: VoterIdentity) -> Self {
        identity.key()
    }
}

impl TryFrom<String> for VoterIdentity {
    type Error = IdentityError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        VoterIdentity::parse_key(&key)
    }
}

/// What the transport knows about a requester before identity is decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub authenticated_user: Option<Uuid>,
    pub guest_token: Option<String>,
    pub network_origin: String,
}

/// Authenticated users always win. Guests are fingerprinted from their client
/// token, or from the network origin when no token was sent.
///
/// The origin fallback is weak: every guest behind one shared address resolves
/// to the same identity and can only vote once between them.
pub fn resolve_identity(ctx: &RequestContext) -> VoterIdentity {
    if let Some(user_id) = ctx.authenticated_user {
        return VoterIdentity::User(user_id);
    }

    match ctx.guest_token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => VoterIdentity::Guest(guest_fingerprint("token", token)),
        None => VoterIdentity::Guest(guest_fingerprint("origin", &ctx.network_origin)),
    }
}

pub fn guest_fingerprint(source: &str, value: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use sha2::{Sha256, Digest};

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Resolved requester, as handed to route handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: VoterIdentity,
    pub origin: String,
}

#[cfg(feature = "backend")]
mod backend_impl {
    use super::*;
    use rocket::http::Status;
    use rocket::request::{FromRequest, Outcome};
    use rocket::Request;

    fn network_origin(req: &Request<'_>) -> String {
        let headers = req.headers();
        headers.get_one("X-Real-IP")
            .or_else(|| headers.get_one("X-Forwarded-For").and_then(|v| v.split(',').next()))
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| req.remote().map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    #[rocket::async_trait]
    impl<'r> FromRequest<'r> for Caller {
        type Error = IdentityError;

        async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
            let headers = req.headers();

            let authenticated_user = match headers.get_one(AUTHENTICATED_USER_HEADER) {
                Some(raw) => match Uuid::parse_str(raw.trim()) {
                    Ok(id) => Some(id),
                    Err(_) => {
                        return Outcome::Error((
                            Status::Unauthorized,
                            IdentityError::InvalidUserId(raw.to_string()),
                        ))
                    }
                },
                None => None,
            };

            let ctx = RequestContext {
                authenticated_user,
                guest_token: headers.get_one(GUEST_TOKEN_HEADER).map(str::to_string),
                network_origin: network_origin(req),
            };

            Outcome::Success(Caller {
                identity: resolve_identity(&ctx),
                origin: ctx.network_origin,
            })
        }
    }
}
