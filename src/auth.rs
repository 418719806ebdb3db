//! Auth (C6): stateless JWT verification and role-based authorization.
//!
//! Tokens are issued externally (user management is a non-goal); this
//! component only verifies signatures and decides permission. No database,
//! no persisted session — `validate_token` is a pure function of the
//! signing key and the token string.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("malformed claims: {0}")]
    MalformedClaims(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer = 1,
    Operator = 2,
    Admin = 3,
}

impl Role {
    pub fn rank(self) -> u8 {
        self as u8
    }

    fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(AuthError::MalformedClaims(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawClaims {
    sub: String,
    role: String,
    exp: i64,
}

#[derive(Debug, Clone)]
pub struct Claims {
    pub user_id: String,
    pub role: Role,
    pub expires_at: i64,
}

/// Minimum role required for each method class, per §4.6. Checked by rank,
/// never by string equality — adding a role between `operator` and `admin`
/// would not require touching this table.
const PERMISSION_TABLE: &[(&str, Role)] = &[
    ("ping", Role::Viewer),
    ("authenticate", Role::Viewer),
    ("get_camera_list", Role::Viewer),
    ("get_camera_status", Role::Viewer),
    ("get_streams", Role::Viewer),
    ("list_recordings", Role::Viewer),
    ("list_snapshots", Role::Viewer),
    ("get_recording_info", Role::Viewer),
    ("get_snapshot_info", Role::Viewer),
    ("get_status", Role::Viewer),
    ("get_server_info", Role::Viewer),
    ("get_metrics", Role::Viewer),
    ("take_snapshot", Role::Operator),
    ("start_recording", Role::Operator),
    ("stop_recording", Role::Operator),
    ("delete_recording", Role::Admin),
    ("delete_snapshot", Role::Admin),
    ("set_retention_policy", Role::Admin),
    ("cleanup_old_files", Role::Admin),
    ("get_storage_info", Role::Admin),
];

/// `ping` and `authenticate` are the only methods with no role floor at all;
/// everything else in the table still requires *some* authenticated role.
/// Methods outside the table are rejected by the dispatcher as unknown
/// before authorization is even consulted.
const NO_AUTH_REQUIRED: &[&str] = &["ping", "authenticate"];

pub struct Auth {
    signing_key: DecodingKey,
}

impl Auth {
    pub fn new(signing_key: &str) -> Self {
        Self {
            signing_key: DecodingKey::from_secret(signing_key.as_bytes()),
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<RawClaims>(token, &self.signing_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) => {
                    AuthError::InvalidFormat
                }
                _ => AuthError::MalformedClaims(e.to_string()),
            }
        })?;

        let role = Role::parse(&data.claims.role)?;

        Ok(Claims {
            user_id: data.claims.sub,
            role,
            expires_at: data.claims.exp,
        })
    }

    /// Whether `role` is permitted to invoke `method`. Unknown methods are
    /// not this component's concern — the dispatcher rejects them as
    /// `METHOD_NOT_FOUND` before reaching here.
    pub fn permits(&self, role: Role, method: &str) -> bool {
        PERMISSION_TABLE
            .iter()
            .find(|(m, _)| *m == method)
            .map(|(_, min_role)| role.rank() >= min_role.rank())
            .unwrap_or(false)
    }

    pub fn requires_auth(method: &str) -> bool {
        !NO_AUTH_REQUIRED.contains(&method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_hierarchy_is_a_total_order_by_rank() {
        assert!(Role::Admin.rank() > Role::Operator.rank());
        assert!(Role::Operator.rank() > Role::Viewer.rank());
    }

    #[test]
    fn permission_table_respects_rank_not_identity() {
        let auth = Auth::new("test-secret");
        assert!(auth.permits(Role::Admin, "start_recording"));
        assert!(auth.permits(Role::Operator, "start_recording"));
        assert!(!auth.permits(Role::Viewer, "start_recording"));
        assert!(auth.permits(Role::Admin, "delete_recording"));
        assert!(!auth.permits(Role::Operator, "delete_recording"));
    }

    #[test]
    fn unknown_method_is_never_permitted() {
        let auth = Auth::new("test-secret");
        assert!(!auth.permits(Role::Admin, "no_such_method"));
    }

    #[test]
    fn ping_and_authenticate_require_no_prior_auth() {
        assert!(!Auth::requires_auth("ping"));
        assert!(!Auth::requires_auth("authenticate"));
        assert!(Auth::requires_auth("start_recording"));
    }

    #[test]
    fn expired_token_is_rejected() {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let key = "test-secret";
        let claims = RawClaims {
            sub: "user-1".to_string(),
            role: "admin".to_string(),
            exp: 0, // 1970 — already expired
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(key.as_bytes()))
            .unwrap();
        let auth = Auth::new(key);
        let err = auth.validate_token(&token).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn valid_token_round_trips_claims() {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let key = "test-secret";
        let claims = RawClaims {
            sub: "user-1".to_string(),
            role: "operator".to_string(),
            exp: 4_102_444_800, // year 2100
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(key.as_bytes()))
            .unwrap();
        let auth = Auth::new(key);
        let decoded = auth.validate_token(&token).unwrap();
        assert_eq!(decoded.user_id, "user-1");
        assert_eq!(decoded.role, Role::Operator);
    }
}
