use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Principal, Role, UserId},
    error::{ApiException, ErrorCode},
};

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    name: String,
    role: Role,
    exp: i64,
}

pub fn mint_token(config: &AuthConfig, principal: &Principal) -> anyhow::Result<String> {
    let claims = Claims {
        sub: principal.user_id.0,
        name: principal.display_name.clone(),
        role: principal.role,
        exp: (Utc::now() + Duration::seconds(config.token_ttl_seconds)).timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?;
    Ok(token)
}

/// Handshake-time credential check: signature and expiry only, no session
/// lookup. An invalid credential refuses the connection before any room
/// access is possible.
pub fn authenticate(config: &AuthConfig, token: &str) -> Result<Principal, ApiException> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| {
        ApiException::new(
            ErrorCode::Unauthenticated,
            format!("invalid bearer credential: {err}"),
        )
    })?;
    Ok(Principal {
        user_id: UserId(data.claims.sub),
        display_name: data.claims.name,
        role: data.claims.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            secret: "test-secret".into(),
            token_ttl_seconds: 60,
        }
    }

    fn principal() -> Principal {
        Principal {
            user_id: UserId(7),
            display_name: "Alice Ngo".into(),
            role: Role::Employee,
        }
    }

    #[test]
    fn round_trips_a_valid_token() {
        let config = config();
        let token = mint_token(&config, &principal()).expect("mint");
        let authenticated = authenticate(&config, &token).expect("authenticate");
        assert_eq!(authenticated, principal());
    }

    #[test]
    fn rejects_a_token_signed_with_another_secret() {
        let token = mint_token(&config(), &principal()).expect("mint");
        let other = AuthConfig {
            secret: "other-secret".into(),
            token_ttl_seconds: 60,
        };
        let err = authenticate(&other, &token).expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Unauthenticated));
    }

    #[test]
    fn rejects_an_expired_token() {
        let expired = AuthConfig {
            secret: "test-secret".into(),
            token_ttl_seconds: -120,
        };
        let token = mint_token(&expired, &principal()).expect("mint");
        let err = authenticate(&config(), &token).expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Unauthenticated));
    }

    #[test]
    fn rejects_garbage() {
        let err = authenticate(&config(), "not-a-jwt").expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Unauthenticated));
    }
}
