use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::AppState;

/// Keys of the process-wide settings table. Adding a key means adding it here,
/// to `SETTINGS`, and to the `Settings` struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    DeleteOldTtlMinutes,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::DeleteOldTtlMinutes => "delete_old_ttl_minutes",
        }
    }
}

pub struct SettingSpec {
    pub key: SettingKey,
    pub min: i64,
    pub max: i64,
    pub default: Option<i64>,
}

/// One year in minutes.
const TTL_MAX_MINUTES: i64 = 60 * 24 * 365;

/// Declared range per key, checked before anything is persisted.
pub const SETTINGS: &[SettingSpec] = &[SettingSpec {
    key: SettingKey::DeleteOldTtlMinutes,
    min: 1,
    max: TTL_MAX_MINUTES,
    default: None,
}];

/// Wire and storage shape of the settings map. Null means "feature off".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub delete_old_ttl_minutes: Option<i64>,
}

impl Settings {
    pub fn get(&self, key: SettingKey) -> Option<i64> {
        match key {
            SettingKey::DeleteOldTtlMinutes => self.delete_old_ttl_minutes,
        }
    }

    pub fn set(&mut self, key: SettingKey, value: Option<i64>) {
        match key {
            SettingKey::DeleteOldTtlMinutes => self.delete_old_ttl_minutes = value,
        }
    }
}

pub fn validate(settings: &Settings) -> Result<(), ApiError> {
    for spec in SETTINGS {
        if let Some(value) = settings.get(spec.key) {
            if value < spec.min || value > spec.max {
                return Err(ApiError::Validation(format!(
                    "{} must be between {} and {}",
                    spec.key.as_str(),
                    spec.min,
                    spec.max
                )));
            }
        }
    }
    Ok(())
}

/// Parses a settings write. Every registered key must be present — absent is
/// not the same as null, so a partial body cannot silently null a stored
/// value. Values may be integers, numeric strings, or null; unknown keys are
/// ignored.
pub fn parse_update(body: &serde_json::Map<String, Value>) -> Result<Settings, ApiError> {
    let mut out = Settings::default();
    for spec in SETTINGS {
        let key = spec.key.as_str();
        let raw = body
            .get(key)
            .ok_or_else(|| ApiError::Validation(format!("{key} is required")))?;

        let value = match raw {
            Value::Null => None,
            Value::Number(n) => Some(
                n.as_i64()
                    .ok_or_else(|| ApiError::Validation(format!("{key} must be an integer")))?,
            ),
            Value::String(s) => Some(
                s.parse::<i64>()
                    .map_err(|_| ApiError::Validation(format!("{key} must be an integer")))?,
            ),
            _ => {
                return Err(ApiError::Validation(format!("{key} must be an integer or null")));
            }
        };
        out.set(spec.key, value);
    }
    validate(&out)?;
    Ok(out)
}

// === HTTP handlers ===

pub async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(db.get_settings()?))
}

pub async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Map<String, Value>>,
) -> Result<Json<Settings>, ApiError> {
    let update = parse_update(&body)?;
    let db = state.db.lock().await;
    db.set_settings(&update)?;
    Ok(Json(db.get_settings()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), false)]
    #[case(Some(1), true)]
    #[case(Some(525_600), true)]
    #[case(Some(525_601), false)]
    #[case(Some(-5), false)]
    #[case(None, true)]
    fn ttl_bounds(#[case] value: Option<i64>, #[case] accepted: bool) {
        let settings = Settings { delete_old_ttl_minutes: value };
        assert_eq!(validate(&settings).is_ok(), accepted);
    }

    #[test]
    fn ttl_default_is_null() {
        let spec = &SETTINGS[0];
        assert_eq!(spec.key.as_str(), "delete_old_ttl_minutes");
        assert_eq!(spec.default, None);
    }

    fn body(json: &str) -> serde_json::Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn update_requires_every_known_key() {
        // An empty body must not be read as "null out the TTL".
        assert!(matches!(parse_update(&body("{}")), Err(ApiError::Validation(_))));
    }

    #[test]
    fn missing_key_cannot_wipe_a_stored_value() {
        let db = crate::db::Database::in_memory().unwrap();
        db.set_settings(&Settings { delete_old_ttl_minutes: Some(120) }).unwrap();

        assert!(parse_update(&body("{}")).is_err());
        assert_eq!(db.get_settings().unwrap().delete_old_ttl_minutes, Some(120));
    }

    #[test]
    fn explicit_null_disables_the_setting() {
        let parsed = parse_update(&body(r#"{"delete_old_ttl_minutes": null}"#)).unwrap();
        assert_eq!(parsed.delete_old_ttl_minutes, None);
    }

    #[test]
    fn integer_and_numeric_string_values_are_accepted() {
        let parsed = parse_update(&body(r#"{"delete_old_ttl_minutes": 120}"#)).unwrap();
        assert_eq!(parsed.delete_old_ttl_minutes, Some(120));

        let parsed = parse_update(&body(r#"{"delete_old_ttl_minutes": "120"}"#)).unwrap();
        assert_eq!(parsed.delete_old_ttl_minutes, Some(120));
    }

    #[rstest]
    #[case(r#"{"delete_old_ttl_minutes": 0}"#)]
    #[case(r#"{"delete_old_ttl_minutes": 525601}"#)]
    #[case(r#"{"delete_old_ttl_minutes": 12.5}"#)]
    #[case(r#"{"delete_old_ttl_minutes": "soon"}"#)]
    #[case(r#"{"delete_old_ttl_minutes": true}"#)]
    fn malformed_or_out_of_range_updates_are_rejected(#[case] json: &str) {
        assert!(matches!(parse_update(&body(json)), Err(ApiError::Validation(_))));
    }
}
