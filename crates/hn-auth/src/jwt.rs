use chrono::{DateTime, Duration, Utc};
use hn_error::{HnError, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ISSUER: &str = "hn-identity";
const AUDIENCE: &str = "hn-console";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // subject (user ID)
    pub username: String,   // username
    pub role: String,       // role name
    pub session_id: String, // session ID
    pub exp: i64,           // expiration timestamp
    pub iat: i64,           // issued at timestamp
    pub iss: String,        // issuer
    pub aud: String,        // audience
    pub jti: String,        // JWT ID
    pub typ: String,        // token type: "access" or "refresh"
}

impl Claims {
    fn new(
        user_id: &str,
        username: &str,
        role: &str,
        session_id: &str,
        typ: &str,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            session_id: session_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            jti: Uuid::new_v4().to_string(),
            typ: typ.to_string(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    pub fn is_access_token(&self) -> bool {
        self.typ == "access"
    }

    pub fn is_refresh_token(&self) -> bool {
        self.typ == "refresh"
    }
}

/// HS256 令牌签发与校验
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        let encoding_key = EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.leeway = 0;

        Self {
            encoding_key,
            decoding_key,
            validation,
        }
    }

    /// 生成访问令牌
    pub fn issue_access_token(
        &self,
        user_id: &str,
        username: &str,
        role: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        let claims = Claims::new(user_id, username, role, session_id, "access", ttl);
        self.encode(&claims)
    }

    /// 生成刷新令牌
    pub fn issue_refresh_token(
        &self,
        user_id: &str,
        username: &str,
        role: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        let claims = Claims::new(user_id, username, role, session_id, "refresh", ttl);
        self.encode(&claims)
    }

    fn encode(&self, claims: &Claims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding_key).map_err(|e| HnError::Internal {
            message: format!("Failed to sign token: {}", e),
            details: None,
        })
    }

    /// 验证并解码令牌
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => HnError::AuthExpired {
                    reason: "Token已过期".to_string(),
                },
                jsonwebtoken::errors::ErrorKind::InvalidSignature => HnError::AuthExpired {
                    reason: "Token签名无效".to_string(),
                },
                _ => HnError::AuthExpired {
                    reason: format!("Token验证失败: {}", e),
                },
            })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims> {
        let claims = self.verify_token(token)?;
        if !claims.is_access_token() {
            return Err(HnError::auth_expired("Not an access token"));
        }
        Ok(claims)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims> {
        let claims = self.verify_token(token)?;
        if !claims.is_refresh_token() {
            return Err(HnError::auth_expired("Not a refresh token"));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let jwt = JwtService::new("test_secret_key_123456789");
        let access = jwt
            .issue_access_token("7", "admin", "super_admin", "sess_1", Duration::hours(1))
            .unwrap();
        let claims = jwt.verify_access_token(&access).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.session_id, "sess_1");
        assert!(claims.is_access_token());

        // 访问令牌不能当刷新令牌用
        assert!(jwt.verify_refresh_token(&access).is_err());
    }

    #[test]
    fn test_expired_token_is_auth_expired() {
        let jwt = JwtService::new("test_secret_key_123456789");
        let token = jwt
            .issue_access_token("7", "admin", "admin", "sess_1", Duration::seconds(-10))
            .unwrap();
        assert!(jwt.verify_access_token(&token).unwrap_err().is_auth_expired());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let issuer = JwtService::new("secret-a");
        let verifier = JwtService::new("secret-b");
        let token = issuer
            .issue_refresh_token("7", "admin", "admin", "sess_1", Duration::days(7))
            .unwrap();
        assert!(verifier.verify_refresh_token(&token).is_err());
    }
}
