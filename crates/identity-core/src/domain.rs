//! Domain model for the identity-access service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a registered user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Parent,
}

impl Role {
    /// Database representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Parent => "PARENT",
        }
    }

    /// Parse a role from its database representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADMIN" => Some(Self::Admin),
            "PARENT" => Some(Self::Parent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission status of a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentStatus {
    Active,
    Discharged,
}

impl ParentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Discharged => "Discharged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Active" => Some(Self::Active),
            "Discharged" => Some(Self::Discharged),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

/// A parent account with its admission details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parent {
    #[serde(flatten)]
    pub user: User,
    pub room_number: String,
    pub status: ParentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        assert_eq!(Role::parse(Role::Admin.as_str()), Some(Role::Admin));
        assert_eq!(Role::parse(Role::Parent.as_str()), Some(Role::Parent));
        assert_eq!(Role::parse("GUEST"), None);
    }

    #[test]
    fn test_parent_status_round_trip() {
        assert_eq!(
            ParentStatus::parse(ParentStatus::Active.as_str()),
            Some(ParentStatus::Active)
        );
        assert_eq!(
            ParentStatus::parse(ParentStatus::Discharged.as_str()),
            Some(ParentStatus::Discharged)
        );
        assert_eq!(ParentStatus::parse("Unknown"), None);
    }

    #[test]
    fn test_parent_serializes_flattened() {
        let parent = Parent {
            user: User {
                id: "user-1".into(),
                email: "parent@example.com".into(),
                role: Role::Parent,
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                created_at: Utc::now(),
            },
            room_number: "101".into(),
            status: ParentStatus::Active,
        };

        let value = serde_json::to_value(&parent).unwrap();
        assert_eq!(value["id"], "user-1");
        assert_eq!(value["room_number"], "101");
        assert_eq!(value["role"], "PARENT");
    }
}
