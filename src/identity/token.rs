use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// RBAC scope levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RbacScope {
    Project,
    Domain,
    System,
}

impl RbacScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Domain => "domain",
            Self::System => "system",
        }
    }
}

impl fmt::Display for RbacScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RbacScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "domain" => Ok(Self::Domain),
            "system" => Ok(Self::System),
            other => Err(format!("invalid scope {other}")),
        }
    }
}

/// Policy names matched for a token, per scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedPolicies {
    #[serde(default)]
    pub system: Vec<String>,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub project: Vec<String>,
}

impl ScopedPolicies {
    /// Highest scope with at least one matched policy.
    #[must_use]
    pub fn level(&self) -> RbacScope {
        if !self.system.is_empty() {
            RbacScope::System
        } else if !self.domain.is_empty() {
            RbacScope::Domain
        } else {
            RbacScope::Project
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRoleAssignment {
    pub project_id: String,
    #[serde(default)]
    pub policies: ScopedPolicies,
}

/// Serialization flavour of a persisted backend token.
///
/// `V2` records carry the identifier inside the JSON body; `V3` records keep it
/// in a separate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVersion {
    V2,
    V3,
}

impl TokenVersion {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }
}

impl FromStr for TokenVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v2" => Ok(Self::V2),
            "v3" => Ok(Self::V3),
            other => Err(format!("unknown token version {other}")),
        }
    }
}

/// Credential issued by the identity backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendToken {
    #[serde(default)]
    pub id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub project_domain_id: String,
    #[serde(default)]
    pub project_domain: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub login_ip: String,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub policies: ScopedPolicies,
    #[serde(default)]
    pub role_assignments: Vec<TokenRoleAssignment>,
}

impl BackendToken {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.id.is_empty() && self.expires_at > now
    }

    /// Seconds left before expiry, zero once expired.
    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_at - now).num_seconds()).unwrap_or(0)
    }

    /// Whether the token's matched policies allow acting at `scope`.
    #[must_use]
    pub fn is_scope_capable(&self, scope: RbacScope) -> bool {
        match scope {
            RbacScope::Project => true,
            RbacScope::Domain => !self.policies.domain.is_empty() || !self.policies.system.is_empty(),
            RbacScope::System => !self.policies.system.is_empty(),
        }
    }

    /// Serialize for the durable store, returning `(body, token_str)`.
    ///
    /// # Errors
    /// Returns an error if the token cannot be encoded as JSON.
    pub fn to_record(&self, version: TokenVersion) -> Result<(String, String), serde_json::Error> {
        let body = serde_json::to_string(self)?;
        let token_str = match version {
            TokenVersion::V2 => String::new(),
            TokenVersion::V3 => self.id.clone(),
        };
        Ok((body, token_str))
    }

    /// Rebuild a token from a durable record.
    ///
    /// # Errors
    /// Returns an error when the body is not a token or carries no identifier.
    pub fn from_record(
        version: TokenVersion,
        body: &str,
        token_str: &str,
    ) -> Result<Self, RecordError> {
        let mut token: Self = serde_json::from_str(body)?;
        if version == TokenVersion::V3 && !token_str.is_empty() {
            token.id = token_str.to_string();
        }
        if token.id.is_empty() {
            return Err(RecordError::MissingIdentifier);
        }
        Ok(token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid token json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token record has no identifier")]
    MissingIdentifier,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token() -> BackendToken {
        BackendToken {
            id: "gAAAA-token".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            user_id: "alice-id".to_string(),
            user: "alice".to_string(),
            ..BackendToken::default()
        }
    }

    #[test]
    fn validity_follows_expiry_and_identifier() {
        let t = token();
        assert!(t.is_valid());
        assert!(!t.is_valid_at(t.expires_at));

        let mut anonymous = token();
        anonymous.id.clear();
        assert!(!anonymous.is_valid());
    }

    #[test]
    fn v3_record_takes_identifier_from_column() {
        let t = token();
        let (mut body, token_str) = t.to_record(TokenVersion::V3).unwrap();
        assert_eq!(token_str, t.id);

        // v3 bodies written by other producers may omit the id entirely
        let mut value: serde_json::Value = serde_json::from_str(&body).unwrap();
        value.as_object_mut().unwrap().remove("id");
        body = value.to_string();

        let restored = BackendToken::from_record(TokenVersion::V3, &body, &token_str).unwrap();
        assert_eq!(restored, t);
    }

    #[test]
    fn v2_record_requires_identifier_in_body() {
        let t = token();
        let (body, token_str) = t.to_record(TokenVersion::V2).unwrap();
        assert!(token_str.is_empty());
        assert_eq!(
            BackendToken::from_record(TokenVersion::V2, &body, "").unwrap(),
            t
        );

        let mut value: serde_json::Value = serde_json::from_str(&body).unwrap();
        value.as_object_mut().unwrap().remove("id");
        assert!(matches!(
            BackendToken::from_record(TokenVersion::V2, &value.to_string(), "ignored"),
            Err(RecordError::MissingIdentifier)
        ));
    }

    #[test]
    fn scope_capability() {
        let mut t = token();
        assert!(t.is_scope_capable(RbacScope::Project));
        assert!(!t.is_scope_capable(RbacScope::System));
        t.policies.system.push("sysadmin".to_string());
        assert!(t.is_scope_capable(RbacScope::System));
        assert!(t.is_scope_capable(RbacScope::Domain));
        assert_eq!(t.policies.level(), RbacScope::System);
    }

    #[test]
    fn scope_parsing() {
        assert_eq!("domain".parse::<RbacScope>(), Ok(RbacScope::Domain));
        assert!("tenant".parse::<RbacScope>().is_err());
        assert!(RbacScope::System > RbacScope::Domain);
    }
}
