//! IPC protocol definitions (JSON messages)

use crate::db::{AppUsageStat, DailySummary, StorageStats, UsageTotals};
use crate::error::Result as StoreResult;
use crate::monitor::MonitorStatus;
use crate::retention::{RetentionPolicy, RetentionReport};
use crate::settings::{parse_theme, UserSettings};
use crate::stats::ProcessUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    GetStats,
    GetStatus,
    PauseMonitoring,
    ResumeMonitoring,
    GetDailyTotals {
        #[serde(default)]
        params: DailyTotalsParams,
    },
    #[serde(rename = "get_24h_usage")]
    Get24hUsage,
    GetAppUsage {
        #[serde(default)]
        params: AppUsageParams,
    },
    GetHistory { params: HistoryParams },
    GetStorageStats,
    ClearData,
    GetSettings,
    UpdateSettings { params: SettingsPatch },
    ApplyRetention { params: ApplyRetentionParams },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyTotalsParams {
    /// `YYYY-MM-DD`; today when absent.
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppUsageParams {
    /// Window in days; the configured retention window when absent.
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryParams {
    pub days: u32,
}

/// Fields left out are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub auto_start: Option<bool>,
    pub theme: Option<String>,
    pub data_retention: Option<RetentionPolicy>,
    pub network_interface: Option<String>,
}

impl SettingsPatch {
    /// Validates every given field before touching `settings`, so a rejected
    /// patch leaves it unchanged.
    pub fn apply(self, settings: &mut UserSettings) -> StoreResult<()> {
        let theme = self.theme.as_deref().map(parse_theme).transpose()?;

        if let Some(auto_start) = self.auto_start {
            settings.auto_start = auto_start;
        }
        if let Some(theme) = theme {
            settings.theme = theme;
        }
        if let Some(retention) = self.data_retention {
            settings.data_retention = retention;
        }
        if let Some(interface) = self.network_interface {
            settings.network_interface = interface.trim().to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRetentionParams {
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Ok,
    Error { message: String },
    Stats { data: HashMap<String, ProcessUsage> },
    Status { data: StatusData },
    DailyTotals { data: DailySummary },
    Usage24h { data: UsageTotals },
    AppUsage { data: Vec<AppUsageStat> },
    History { data: Vec<DailySummary> },
    StorageStats { data: StorageStats },
    Settings { data: UserSettings },
    Retention { data: RetentionReport },
}

impl Response {
    pub fn error(message: impl ToString) -> Self {
        Response::Error { message: message.to_string() }
    }
}

/// Monitor status plus the live aggregate speed; also the periodic broadcast payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    #[serde(flatten)]
    pub monitor: MonitorStatus,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub active_processes: usize,
    pub persistence_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_parse_requests() {
        let req: Request = serde_json::from_str(r#"{"cmd":"get_24h_usage"}"#).unwrap();
        assert!(matches!(req, Request::Get24hUsage));

        let req: Request = serde_json::from_str(r#"{"cmd":"get_daily_totals"}"#).unwrap();
        assert!(matches!(req, Request::GetDailyTotals { params } if params.date.is_none()));

        let req: Request =
            serde_json::from_str(r#"{"cmd":"apply_retention","params":{"retention":-1}}"#).unwrap();
        assert!(matches!(
            req,
            Request::ApplyRetention { params } if params.retention == RetentionPolicy::Forever
        ));
    }

    #[test]
    fn test_invalid_retention_rejected() {
        let req = serde_json::from_str::<Request>(r#"{"cmd":"apply_retention","params":{"retention":-7}}"#);
        assert!(req.is_err());
    }

    #[test]
    fn test_settings_patch_only_touches_given_fields() {
        let mut settings = UserSettings::default();
        let patch: SettingsPatch = serde_json::from_str(r#"{"theme":"dark"}"#).unwrap();
        patch.apply(&mut settings).unwrap();
        assert_eq!(settings.theme, "dark");
        assert_eq!(settings.data_retention, RetentionPolicy::default());
    }

    #[test]
    fn test_settings_patch_rejects_unknown_theme() {
        let mut settings = UserSettings::default();
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"theme":"neon","auto_start":true,"data_retention":7}"#).unwrap();
        let err = patch.apply(&mut settings).unwrap_err();
        assert!(matches!(err, StoreError::InvalidSetting { ref key, .. } if key == "theme"));
        assert_eq!(settings, UserSettings::default());
    }
}
