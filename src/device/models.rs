use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::params::{DisplayParameters, PacingMode, ParameterRecord};
use crate::serial::{ProtocolConfig, ProtocolTiming, ProtocolVariant};
use crate::serial::interface::BAUD_RATE;
use super::{DeviceError, Result};

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// The pacemaker on the other end of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub port_name: String,
    /// Identifier reported by the firmware, or the port name when it reports none
    pub device_id: Option<String>,
    pub connection_state: ConnectionState,
    /// Last record read back by interrogation
    pub parameters: Option<ParameterRecord>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(port_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            port_name,
            device_id: None,
            connection_state: ConnectionState::Disconnected,
            parameters: None,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }

    pub fn update_parameters(&mut self, record: ParameterRecord) {
        self.parameters = Some(record);
        self.last_seen = Utc::now();
    }
}

/// Named parameter set in human units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterProfile {
    pub id: String,
    pub name: String,
    pub mode: PacingMode,
    pub parameters: DisplayParameters,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ParameterProfile {
    pub fn new(name: &str, mode: PacingMode, parameters: DisplayParameters) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            mode,
            parameters,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn update_parameters(&mut self, parameters: DisplayParameters) {
        self.parameters = parameters;
        self.modified_at = Utc::now();
    }

    /// Wire record for programming; profiles always request a parameter echo
    pub fn to_record(&self) -> ParameterRecord {
        self.parameters
            .to_record(self.mode, crate::params::RESPONSE_TYPE_PARAMETERS)
    }
}

/// Parameter profile management
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileManager {
    pub profiles: Vec<ParameterProfile>,
    pub active_profile_id: Option<String>,
}

impl ProfileManager {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            active_profile_id: None,
        }
    }

    /// Profile names are unique, case-insensitively
    pub fn add_profile(&mut self, profile: ParameterProfile) -> Result<()> {
        if self.get_profile_by_name(&profile.name).is_some() {
            return Err(DeviceError::Profile(format!("Profile '{}' already exists", profile.name)));
        }
        self.profiles.push(profile);
        Ok(())
    }

    pub fn remove_profile(&mut self, profile_id: &str) -> bool {
        if let Some(pos) = self.profiles.iter().position(|p| p.id == profile_id) {
            self.profiles.remove(pos);

            // Clear active profile if it was removed
            if self.active_profile_id.as_deref() == Some(profile_id) {
                self.active_profile_id = None;
            }

            true
        } else {
            false
        }
    }

    pub fn get_profile(&self, profile_id: &str) -> Option<&ParameterProfile> {
        self.profiles.iter().find(|p| p.id == profile_id)
    }

    pub fn get_profile_by_name(&self, name: &str) -> Option<&ParameterProfile> {
        self.profiles.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get_profile_mut(&mut self, profile_id: &str) -> Option<&mut ParameterProfile> {
        self.profiles.iter_mut().find(|p| p.id == profile_id)
    }

    pub fn set_active_profile(&mut self, profile_id: &str) -> bool {
        if self.profiles.iter().any(|p| p.id == profile_id) {
            self.active_profile_id = Some(profile_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn get_active_profile(&self) -> Option<&ParameterProfile> {
        self.active_profile_id.as_ref()
            .and_then(|id| self.get_profile(id))
    }

    /// Nominal settings for `mode`
    pub fn create_default_profile(mode: PacingMode) -> ParameterProfile {
        ParameterProfile::new(&format!("Default {}", mode), mode, DisplayParameters::default())
    }

    /// A missing file yields an empty manager
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No profile store at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let data = std::fs::read_to_string(path)?;
        let manager: Self = serde_json::from_str(&data)
            .map_err(|e| DeviceError::Profile(format!("Failed to parse {}: {}", path.display(), e)))?;
        log::info!("Loaded {} profiles from {}", manager.profiles.len(), path.display());
        Ok(manager)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| DeviceError::Profile(format!("Failed to serialize profiles: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)?;
        log::debug!("Saved {} profiles to {}", self.profiles.len(), path.display());
        Ok(())
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    /// Serial port; the debug probe's port is used when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub variant: ProtocolVariant,
    pub poll_interval_ms: u64,
    pub signal_buffer_len: usize,
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: BAUD_RATE,
            connect_timeout_ms: 1000,
            read_timeout_ms: 1000,
            variant: ProtocolVariant::default(),
            poll_interval_ms: 40,
            signal_buffer_len: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl AppSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&data)
            .map_err(|e| DeviceError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| DeviceError::InvalidConfiguration(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(DeviceError::InvalidConfiguration("baud_rate must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(DeviceError::InvalidConfiguration("poll_interval_ms must be positive".to_string()));
        }
        if self.signal_buffer_len == 0 {
            return Err(DeviceError::InvalidConfiguration("signal_buffer_len must be positive".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            variant: self.variant,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            timing: ProtocolTiming::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_names_are_unique() {
        let mut manager = ProfileManager::new();
        manager.add_profile(ProfileManager::create_default_profile(PacingMode::Vvi)).unwrap();
        let err = manager
            .add_profile(ParameterProfile::new("default vvi", PacingMode::Aai, DisplayParameters::default()))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Profile(_)));
    }

    #[test]
    fn test_removing_active_profile_clears_it() {
        let mut manager = ProfileManager::new();
        let profile = ProfileManager::create_default_profile(PacingMode::Aoo);
        let id = profile.id.clone();
        manager.add_profile(profile).unwrap();
        assert!(manager.set_active_profile(&id));
        assert!(!manager.set_active_profile("missing"));
        assert!(manager.remove_profile(&id));
        assert!(manager.get_active_profile().is_none());
        assert!(!manager.remove_profile(&id));
    }

    #[test]
    fn test_settings_defaults_fill_partial_json() {
        let settings: AppSettings = serde_json::from_str(r#"{"variant": "acknowledged", "port": "COM3"}"#).unwrap();
        assert_eq!(settings.variant, ProtocolVariant::Acknowledged);
        assert_eq!(settings.port.as_deref(), Some("COM3"));
        assert_eq!(settings.baud_rate, 115200);
        assert_eq!(settings.poll_interval(), Duration::from_millis(40));
        assert_eq!(settings.protocol_config().read_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_settings_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = AppSettings {
            port: Some("/dev/ttyACM1".to_string()),
            variant: ProtocolVariant::Acknowledged,
            ..AppSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(AppSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_settings_validation() {
        let settings = AppSettings {
            poll_interval_ms: 0,
            ..AppSettings::default()
        };
        assert!(matches!(settings.validate(), Err(DeviceError::InvalidConfiguration(_))));
        assert!(AppSettings::default().validate().is_ok());
    }
}
