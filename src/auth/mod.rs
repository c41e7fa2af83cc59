//! Operator authentication.
//!
//! There is exactly one privilege level. Operators are listed in the
//! configuration; a successful sign-in yields a signed session token that
//! stays valid until it expires or is signed out.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    config,
    core::{constant_time_eq, ReliefError, ReliefResult},
    metrics,
};

/// Secrets with this prefix are base64 encoded key material.
const BASE64_SECRET_PREFIX: &str = "base64:";

const ISSUER: &str = "reliefops";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// An authenticated operator session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    id: String,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct OperatorAuth {
    operators: HashMap<String, String>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    // jti -> exp, kept until the token would have expired anyway
    revoked: DashMap<String, i64>,
    session: watch::Sender<Option<Session>>,
}

impl OperatorAuth {
    pub fn from_config(cfg: &config::Auth) -> ReliefResult<Self> {
        let secret = match cfg.secret.strip_prefix(BASE64_SECRET_PREFIX) {
            Some(encoded) => STANDARD.decode(encoded.trim()).map_err(|e| {
                ReliefError::Configuration(format!("auth secret is not valid base64: {e}"))
            })?,
            None => cfg.secret.as_bytes().to_vec(),
        };
        let ttl = i64::try_from(cfg.token_ttl)
            .map_err(|_| ReliefError::Configuration("token_ttl is too large".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let operators = cfg
            .operators
            .iter()
            .map(|op| (normalize_email(&op.email), op.password.clone()))
            .collect();

        let (session, _) = watch::channel(None);
        Ok(Self {
            operators,
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
            validation,
            token_ttl: Duration::seconds(ttl),
            revoked: DashMap::new(),
            session,
        })
    }

    /// Exchange operator credentials for a session.
    pub fn sign_in(&self, email: &str, password: &str) -> ReliefResult<Session> {
        let email = normalize_email(email);
        let accepted = match self.operators.get(&email) {
            Some(expected) => constant_time_eq(expected, password),
            None => {
                // compare anyway so unknown accounts take the same time
                let _ = constant_time_eq(password, password);
                false
            }
        };
        if !accepted {
            metrics::SIGNIN_FAILURES.inc();
            log::warn!("Rejected operator sign-in for '{email}'");
            return Err(ReliefError::Unauthorized(
                "invalid email or password".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = now + self.token_ttl;
        let claims = Claims {
            sub: email.clone(),
            jti: Uuid::new_v4().to_string(),
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        let session = Session {
            email,
            token,
            expires_at,
            id: claims.jti,
        };
        self.session.send_replace(Some(session.clone()));
        log::info!("Operator '{}' signed in", session.email);
        Ok(session)
    }

    /// Check a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> ReliefResult<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        if self.revoked.contains_key(&claims.jti) {
            return Err(ReliefError::Unauthorized(
                "session has been signed out".to_string(),
            ));
        }
        if !self.operators.contains_key(&claims.sub) {
            return Err(ReliefError::Unauthorized(
                "operator is no longer configured".to_string(),
            ));
        }
        Ok(claims)
    }

    /// End the session identified by `token`.
    pub fn sign_out(&self, token: &str) -> ReliefResult<()> {
        let claims = self.verify(token)?;

        let now = Utc::now().timestamp();
        self.revoked.retain(|_, exp| *exp > now);
        self.revoked.insert(claims.jti.clone(), claims.exp);

        self.session.send_if_modified(|current| {
            let ended = current.as_ref().is_some_and(|s| s.id == claims.jti);
            if ended {
                *current = None;
            }
            ended
        });
        log::info!("Operator '{}' signed out", claims.sub);
        Ok(())
    }

    /// Latest session presence; changes on every sign-in and matching sign-out.
    pub fn on_session_change(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config(secret: &str) -> config::Auth {
        config::Auth {
            secret: secret.to_string(),
            token_ttl: 3600,
            operators: vec![config::Operator {
                email: "Ops@Example.org".to_string(),
                password: "correct horse".to_string(),
            }],
        }
    }

    fn auth() -> OperatorAuth {
        OperatorAuth::from_config(&auth_config("0123456789abcdef")).unwrap()
    }

    #[test]
    fn test_sign_in() {
        let auth = auth();
        let session = auth.sign_in(" ops@example.org ", "correct horse").unwrap();
        assert_eq!(session.email, "ops@example.org");
        assert!(session.expires_at > Utc::now());

        let claims = auth.verify(&session.token).unwrap();
        assert_eq!(claims.sub, "ops@example.org");
        assert_eq!(claims.jti, session.id());
    }

    #[test]
    fn test_sign_in_rejected() {
        let auth = auth();
        for (email, password) in [
            ("ops@example.org", "wrong horse"),
            ("ops@example.org", ""),
            ("nobody@example.org", "correct horse"),
        ] {
            let err = auth.sign_in(email, password).unwrap_err();
            assert!(matches!(err, ReliefError::Unauthorized(_)));
        }
    }

    #[test]
    fn test_verify_rejects_bad_tokens() {
        let auth = auth();
        let session = auth.sign_in("ops@example.org", "correct horse").unwrap();

        assert!(auth.verify("not-a-token").is_err());

        let other = OperatorAuth::from_config(&auth_config("fedcba9876543210")).unwrap();
        let foreign = other.sign_in("ops@example.org", "correct horse").unwrap();
        assert!(matches!(
            auth.verify(&foreign.token),
            Err(ReliefError::Unauthorized(_))
        ));

        let expired = Claims {
            sub: "ops@example.org".to_string(),
            jti: Uuid::new_v4().to_string(),
            iss: ISSUER.to_string(),
            iat: Utc::now().timestamp() - 7200,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = encode(&Header::default(), &expired, &auth.encoding).unwrap();
        assert!(auth.verify(&token).is_err());

        assert!(auth.verify(&session.token).is_ok());
    }

    #[test]
    fn test_sign_out_revokes() {
        let auth = auth();
        let first = auth.sign_in("ops@example.org", "correct horse").unwrap();
        let second = auth.sign_in("ops@example.org", "correct horse").unwrap();

        auth.sign_out(&first.token).unwrap();
        assert!(auth.verify(&first.token).is_err());
        assert!(auth.sign_out(&first.token).is_err());
        assert!(auth.verify(&second.token).is_ok());
    }

    #[test]
    fn test_on_session_change() {
        let auth = auth();
        let rx = auth.on_session_change();
        assert!(rx.borrow().is_none());

        let first = auth.sign_in("ops@example.org", "correct horse").unwrap();
        assert_eq!(rx.borrow().as_ref().map(Session::id), Some(first.id()));

        let second = auth.sign_in("ops@example.org", "correct horse").unwrap();
        // signing out an older session leaves the latest one in place
        auth.sign_out(&first.token).unwrap();
        assert_eq!(rx.borrow().as_ref().map(Session::id), Some(second.id()));

        auth.sign_out(&second.token).unwrap();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn test_base64_secret() {
        let encoded = format!("base64:{}", STANDARD.encode("0123456789abcdef0123"));
        let auth = OperatorAuth::from_config(&auth_config(&encoded)).unwrap();
        let session = auth.sign_in("ops@example.org", "correct horse").unwrap();
        assert!(auth.verify(&session.token).is_ok());

        let err = OperatorAuth::from_config(&auth_config("base64:!!not base64!!")).err();
        assert!(matches!(err, Some(ReliefError::Configuration(_))));
    }
}
