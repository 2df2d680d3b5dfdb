use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::UserId;

/// Static description of an achievement, embedded in grant rows when the
/// store joins it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// A user earning an achievement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementGrant {
    pub id: String,
    pub achievement_id: String,
    pub user_id: UserId,
    #[serde(alias = "earned_at")]
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievement: Option<AchievementDefinition>,
}

impl AchievementGrant {
    pub fn title(&self) -> &str {
        self.achievement
            .as_ref()
            .map(|a| a.name.as_str())
            .unwrap_or(self.achievement_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_with_embedded_definition() {
        let json = r#"{
            "id": "g-1",
            "achievement_id": "first-workout",
            "user_id": "client-1",
            "earned_at": "2024-05-01T10:00:00Z",
            "achievement": {"id": "first-workout", "name": "Primeiro treino"}
        }"#;
        let grant: AchievementGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.title(), "Primeiro treino");
    }

    #[test]
    fn test_title_falls_back_to_definition_id() {
        let json = r#"{
            "id": "g-2",
            "achievement_id": "streak-7",
            "user_id": "client-1",
            "granted_at": "2024-05-01T10:00:00Z"
        }"#;
        let grant: AchievementGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.title(), "streak-7");
    }
}
