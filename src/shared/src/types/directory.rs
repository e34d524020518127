//! Read-only directory records the dispatch engine targets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// A user that can receive notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Contact number on the guardian profile.
    pub parent_phone: Option<String>,
    /// Contact number on the staff profile.
    pub staff_phone: Option<String>,
    pub is_active: bool,
}

impl Recipient {
    /// SMS number: the account phone first, then the profile phone matching
    /// the role, then any other profile phone.
    pub fn sms_number(&self) -> Option<&str> {
        let role_phone = match self.role.to_ascii_uppercase().as_str() {
            "PARENT" | "GUARDIAN" => self.parent_phone.as_deref(),
            "TEACHER" | "ADMIN" | "SCHOOL_ADMIN" | "STAFF" => self.staff_phone.as_deref(),
            _ => None,
        };
        non_empty(self.phone.as_deref())
            .or(non_empty(role_phone))
            .or(non_empty(self.parent_phone.as_deref()))
            .or(non_empty(self.staff_phone.as_deref()))
    }

    pub fn email_address(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudentStatus {
    Active,
    Inactive,
    Graduated,
    Transferred,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Graduated => "GRADUATED",
            Self::Transferred => "TRANSFERRED",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            "GRADUATED" => Ok(Self::Graduated),
            "TRANSFERRED" => Ok(Self::Transferred),
            other => Err(ParseEnumError::new("student status", other)),
        }
    }
}

/// A student enrolment; links a class to the student's own account and guardians.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Student {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub class_id: Uuid,
    pub status: StudentStatus,
    pub guardian_user_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(role: &str) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: role.to_string(),
            display_name: None,
            email: Some("someone@school.test".to_string()),
            phone: None,
            parent_phone: Some("+15550001".to_string()),
            staff_phone: Some("+15550002".to_string()),
            is_active: true,
        }
    }

    #[test]
    fn test_sms_number_prefers_account_phone() {
        let mut user = recipient("PARENT");
        user.phone = Some("+15559999".to_string());
        assert_eq!(user.sms_number(), Some("+15559999"));
    }

    #[test]
    fn test_sms_number_falls_back_to_role_phone() {
        assert_eq!(recipient("PARENT").sms_number(), Some("+15550001"));
        assert_eq!(recipient("teacher").sms_number(), Some("+15550002"));
        assert_eq!(recipient("STUDENT").sms_number(), Some("+15550001"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let mut user = recipient("STUDENT");
        user.email = Some("  ".to_string());
        user.phone = Some(String::new());
        user.parent_phone = None;
        user.staff_phone = None;
        assert_eq!(user.email_address(), None);
        assert_eq!(user.sms_number(), None);
    }
}
