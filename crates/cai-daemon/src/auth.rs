//! Mock authentication: a static bearer-token → user mapping.
//!
//! Real identity lives behind the firm's SSO; until that integration
//! lands, intake maps a handful of demo tokens onto seeded advisor
//! accounts and everything else onto the shared demo advisor. Nothing
//! here is a security boundary.

use std::collections::HashMap;

use axum::http::HeaderMap;

use cai_schemas::UserRole;

/// The caller identity intake operates on.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub role: UserRole,
}

pub struct MockAuth {
    tokens: HashMap<String, AuthedUser>,
    fallback: AuthedUser,
}

impl MockAuth {
    pub fn with_demo_users() -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(
            "demo-token-senior".to_string(),
            AuthedUser {
                user_id: "advisor-senior-001".to_string(),
                role: UserRole::SeniorAdvisor,
            },
        );
        tokens.insert(
            "demo-token-advisor".to_string(),
            AuthedUser {
                user_id: "advisor-002".to_string(),
                role: UserRole::Advisor,
            },
        );
        tokens.insert(
            "demo-token-staff".to_string(),
            AuthedUser {
                user_id: "staff-003".to_string(),
                role: UserRole::Staff,
            },
        );

        Self {
            tokens,
            fallback: AuthedUser {
                user_id: "advisor-demo".to_string(),
                role: UserRole::FinancialAdvisor,
            },
        }
    }

    /// Resolve the caller from the Authorization header. Unknown or missing
    /// tokens resolve to the demo advisor.
    pub fn resolve(&self, headers: &HeaderMap) -> AuthedUser {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token.and_then(|t| self.tokens.get(t)) {
            Some(user) => user.clone(),
            None => self.fallback.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn known_token_resolves_its_user() {
        let auth = MockAuth::with_demo_users();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer demo-token-senior"),
        );
        let user = auth.resolve(&headers);
        assert_eq!(user.user_id, "advisor-senior-001");
        assert_eq!(user.role, UserRole::SeniorAdvisor);
    }

    #[test]
    fn missing_or_unknown_token_falls_back_to_the_demo_advisor() {
        let auth = MockAuth::with_demo_users();

        let user = auth.resolve(&HeaderMap::new());
        assert_eq!(user.user_id, "advisor-demo");

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer nonsense"),
        );
        assert_eq!(auth.resolve(&headers).user_id, "advisor-demo");
    }
}
