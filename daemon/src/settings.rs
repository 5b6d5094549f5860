//! Persisted user settings (key/value rows in the settings table)

use crate::error::{Result, StoreError};
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const KEY_AUTO_START: &str = "auto_start";
pub const KEY_THEME: &str = "theme";
pub const KEY_DATA_RETENTION: &str = "data_retention";
pub const KEY_NETWORK_INTERFACE: &str = "network_interface";

pub const THEMES: [&str; 3] = ["auto", "light", "dark"];

/// Narrow access to persisted settings; implemented by the database.
pub trait SettingsStore {
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub auto_start: bool,
    pub theme: String,
    pub data_retention: RetentionPolicy,
    /// Restrict counters to one interface; empty means all.
    pub network_interface: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            auto_start: false,
            theme: "auto".to_string(),
            data_retention: RetentionPolicy::default(),
            network_interface: String::new(),
        }
    }
}

impl UserSettings {
    /// Missing or unparsable values fall back to their defaults.
    pub fn load<S: SettingsStore + ?Sized>(store: &S) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(value) = non_empty(store.get_setting(KEY_AUTO_START)?) {
            settings.auto_start = value == "true";
        }
        if let Some(value) = non_empty(store.get_setting(KEY_THEME)?) {
            match parse_theme(&value) {
                Ok(theme) => settings.theme = theme,
                Err(e) => warn!("Ignoring stored setting: {}", e),
            }
        }
        if let Some(value) = non_empty(store.get_setting(KEY_DATA_RETENTION)?) {
            match parse_retention(&value) {
                Ok(policy) => settings.data_retention = policy,
                Err(e) => warn!("Ignoring stored setting: {}", e),
            }
        }
        if let Some(value) = non_empty(store.get_setting(KEY_NETWORK_INTERFACE)?) {
            settings.network_interface = value;
        }

        Ok(settings)
    }

    pub fn save<S: SettingsStore + ?Sized>(&self, store: &S) -> Result<()> {
        store.set_setting(KEY_AUTO_START, &self.auto_start.to_string())?;
        store.set_setting(KEY_THEME, &self.theme)?;
        store.set_setting(KEY_DATA_RETENTION, &self.data_retention.as_setting().to_string())?;
        store.set_setting(KEY_NETWORK_INTERFACE, &self.network_interface)?;
        Ok(())
    }

    pub fn interface(&self) -> Option<String> {
        Some(self.network_interface.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

/// Parse the numeric `data_retention` setting; values below -2 are rejected.
pub fn parse_retention(value: &str) -> Result<RetentionPolicy> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|e| e.to_string())
        .and_then(RetentionPolicy::try_from)
        .map_err(|reason| StoreError::InvalidSetting {
            key: KEY_DATA_RETENTION.to_string(),
            value: value.to_string(),
            reason,
        })
}

/// Accepts one of [`THEMES`], ignoring case and surrounding whitespace.
pub fn parse_theme(value: &str) -> Result<String> {
    let theme = value.trim().to_ascii_lowercase();
    if THEMES.contains(&theme.as_str()) {
        Ok(theme)
    } else {
        Err(StoreError::InvalidSetting {
            key: KEY_THEME.to_string(),
            value: value.to_string(),
            reason: format!("expected one of {}", THEMES.join(", ")),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retention() {
        assert_eq!(parse_retention("14").unwrap(), RetentionPolicy::Days(14));
        assert_eq!(parse_retention(" -1 ").unwrap(), RetentionPolicy::Forever);
        assert!(matches!(parse_retention("-3"), Err(StoreError::InvalidSetting { .. })));
        assert!(parse_retention("weekly").is_err());
    }

    #[test]
    fn test_parse_theme() {
        assert_eq!(parse_theme(" Dark").unwrap(), "dark");
        assert_eq!(parse_theme("auto").unwrap(), "auto");
        assert!(matches!(
            parse_theme("solarized"),
            Err(StoreError::InvalidSetting { key, .. }) if key == KEY_THEME
        ));
    }
}
