use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{AppSettings, Device, DeviceError, DeviceManager, ParameterProfile, ProfileManager};
use crate::params::{DisplayParameters, PacingMode, ParameterRecord, SignalFrame};
use crate::serial::{
    EchoVerification, ProtocolConfig, ProtocolTiming, SerialPortInfo, SimulatedPacemaker,
};
use crate::serial::simulator::SIMULATOR_NAME;

/// Outcome of a caller-facing operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> CommandResult<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    fn from_result(result: Result<T, String>, message: &str) -> Self {
        match result {
            Ok(data) => Self::ok(message, data),
            Err(e) => {
                log::error!("{}", e);
                Self::err(e)
            }
        }
    }
}

/// Enumerate serial ports
pub fn list_ports() -> CommandResult<Vec<SerialPortInfo>> {
    let result = DeviceManager::list_ports()
        .map_err(|e| format!("Failed to list ports: {}", e));
    CommandResult::from_result(result, "Ports listed")
}

/// Port of the attached debug probe, if any
pub fn find_marked_port() -> CommandResult<Option<String>> {
    let result = DeviceManager::find_marked_port()
        .map_err(|e| format!("Failed to scan ports: {}", e));
    CommandResult::from_result(result, "Port scan complete")
}

/// Connect to `port`, falling back to the configured port and then the debug probe
pub async fn connect_device(
    device_manager: &DeviceManager,
    port: Option<&str>,
    settings: &AppSettings,
) -> CommandResult<Device> {
    let port = match port.map(str::to_string).or_else(|| settings.port.clone()) {
        Some(port) => port,
        None => match DeviceManager::find_marked_port() {
            Ok(Some(port)) => port,
            Ok(None) => return CommandResult::err("No pacemaker port found"),
            Err(e) => return CommandResult::err(format!("Failed to scan ports: {}", e)),
        },
    };

    let result = device_manager
        .connect(&port, settings)
        .await
        .map_err(|e| format!("Failed to connect to device: {}", e));
    CommandResult::from_result(result, &format!("Connected on {}", port))
}

/// Connect to an in-memory pacemaker speaking the configured variant
pub async fn connect_simulator(device_manager: &DeviceManager, settings: &AppSettings) -> CommandResult<Device> {
    let config = ProtocolConfig {
        timing: ProtocolTiming::immediate(),
        ..settings.protocol_config()
    };
    let simulator = SimulatedPacemaker::new(settings.variant);
    let result = device_manager
        .attach(SIMULATOR_NAME, Box::new(simulator), config)
        .await
        .map_err(|e| format!("Failed to connect to simulator: {}", e));
    CommandResult::from_result(result, "Connected to simulator")
}

/// Disconnect from the currently connected device
pub async fn disconnect_device(device_manager: &DeviceManager) -> CommandResult<()> {
    let result = device_manager
        .disconnect()
        .await
        .map_err(|e| format!("Failed to disconnect device: {}", e));
    CommandResult::from_result(result, "Disconnected")
}

/// Get the current device snapshot
pub async fn get_connected_device(device_manager: &DeviceManager) -> CommandResult<Option<Device>> {
    CommandResult::ok("Device state", device_manager.device().await)
}

/// Program loosely typed wire fields; invalid values are rejected before any I/O
pub async fn program_parameters(
    device_manager: &DeviceManager,
    mode: &str,
    fields: &BTreeMap<String, serde_json::Value>,
) -> CommandResult<ParameterRecord> {
    let mode = PacingMode::from_symbol(mode);
    let record = match ParameterRecord::from_fields(mode, fields) {
        Ok(record) => record,
        Err(e) => return CommandResult::err(format!("Invalid parameters: {}", e)),
    };

    let result = device_manager
        .program(mode, &record)
        .await
        .map(|_| record)
        .map_err(|e| format!("Failed to program parameters: {}", e));
    CommandResult::from_result(result, &format!("Programmed {}", mode))
}

pub async fn interrogate_device(device_manager: &DeviceManager) -> CommandResult<ParameterRecord> {
    let result = device_manager
        .interrogate()
        .await
        .map_err(|e| format!("Failed to interrogate device: {}", e));
    CommandResult::from_result(result, "Parameters read")
}

/// Interrogate and convert to human units
pub async fn interrogate_display(device_manager: &DeviceManager) -> CommandResult<DisplayParameters> {
    let result = device_manager
        .interrogate()
        .await
        .map(|record| DisplayParameters::from_record(&record))
        .map_err(|e| format!("Failed to interrogate device: {}", e));
    CommandResult::from_result(result, "Parameters read")
}

pub async fn get_signals(device_manager: &DeviceManager) -> CommandResult<SignalFrame> {
    let result = device_manager
        .get_signals()
        .await
        .map_err(|e| format!("Failed to read signals: {}", e));
    CommandResult::from_result(result, "Signal frame read")
}

/// Program, read back and compare. `success` mirrors the verification outcome.
pub async fn echo_test(
    device_manager: &DeviceManager,
    mode: &str,
    fields: &BTreeMap<String, serde_json::Value>,
) -> CommandResult<EchoVerification> {
    let mode = PacingMode::from_symbol(mode);
    let record = match ParameterRecord::from_fields(mode, fields) {
        Ok(record) => record,
        Err(e) => return CommandResult::err(format!("Invalid parameters: {}", e)),
    };

    match device_manager.echo_test(mode, &record).await {
        Ok(verification) => CommandResult {
            success: verification.passed,
            message: verification.message.clone(),
            data: Some(verification),
        },
        Err(e) => CommandResult::err(format!("Failed to run echo test: {}", e)),
    }
}

/// Get all profiles
pub async fn get_profiles(device_manager: &DeviceManager) -> CommandResult<ProfileManager> {
    CommandResult::ok("Profiles", device_manager.get_profile_manager().await)
}

pub async fn get_profile(device_manager: &DeviceManager, name: &str) -> CommandResult<ParameterProfile> {
    let profiles = device_manager.get_profile_manager().await;
    match profiles.get_profile_by_name(name) {
        Some(profile) => CommandResult::ok("Profile found", profile.clone()),
        None => CommandResult::err(format!("Profile not found: {}", name)),
    }
}

/// Create a profile after checking its values against the programmable ranges
pub async fn create_profile(
    device_manager: &DeviceManager,
    name: &str,
    mode: PacingMode,
    parameters: DisplayParameters,
) -> CommandResult<ParameterProfile> {
    if let Some(details) = range_violations(mode, &parameters) {
        return CommandResult::err(format!("Invalid parameters: {}", details));
    }

    let profile = ParameterProfile::new(name, mode, parameters);
    let result = device_manager
        .update_profile_manager(|manager| {
            manager.add_profile(profile.clone())?;
            Ok(profile)
        })
        .await
        .map_err(|e| format!("Failed to create profile: {}", e));
    CommandResult::from_result(result, "Profile created")
}

/// Replace a stored profile's parameters, keeping its mode
pub async fn update_profile(
    device_manager: &DeviceManager,
    profile_id: &str,
    parameters: DisplayParameters,
) -> CommandResult<ParameterProfile> {
    let result = device_manager
        .update_profile_manager(|manager| {
            let profile = manager
                .get_profile_mut(profile_id)
                .ok_or_else(|| DeviceError::Profile(format!("no profile with id {}", profile_id)))?;
            if let Some(details) = range_violations(profile.mode, &parameters) {
                return Err(DeviceError::InvalidConfiguration(details));
            }
            profile.update_parameters(parameters);
            Ok(profile.clone())
        })
        .await
        .map_err(|e| format!("Failed to update profile: {}", e));
    CommandResult::from_result(result, "Profile updated")
}

fn range_violations(mode: PacingMode, parameters: &DisplayParameters) -> Option<String> {
    let violations = parameters.validate(mode);
    if violations.is_empty() {
        return None;
    }
    let details: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    Some(details.join(", "))
}

pub async fn delete_profile(device_manager: &DeviceManager, profile_id: &str) -> CommandResult<bool> {
    let result = device_manager
        .update_profile_manager(|manager| Ok(manager.remove_profile(profile_id)))
        .await
        .map_err(|e| format!("Failed to delete profile: {}", e));
    CommandResult::from_result(result, "Profile deleted")
}

pub async fn set_active_profile(device_manager: &DeviceManager, profile_id: &str) -> CommandResult<bool> {
    let result = device_manager
        .update_profile_manager(|manager| Ok(manager.set_active_profile(profile_id)))
        .await
        .map_err(|e| format!("Failed to set active profile: {}", e));
    CommandResult::from_result(result, "Active profile set")
}

/// Program a stored profile and verify it by readback
pub async fn apply_profile(device_manager: &DeviceManager, name: &str) -> CommandResult<EchoVerification> {
    let profile = match device_manager.get_profile_manager().await.get_profile_by_name(name) {
        Some(profile) => profile.clone(),
        None => return CommandResult::err(format!("Profile not found: {}", name)),
    };

    match device_manager.echo_test(profile.mode, &profile.to_record()).await {
        Ok(verification) => CommandResult {
            success: verification.passed,
            message: verification.message.clone(),
            data: Some(verification),
        },
        Err(e) => CommandResult::err(format!("Failed to apply profile: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commands_report_not_connected() {
        let manager = DeviceManager::new();
        let result = interrogate_device(&manager).await;
        assert!(!result.success);
        assert_eq!(result.message, "Failed to interrogate device: Device not connected");
        assert!(result.data.is_none());
    }

    #[tokio::test]
    async fn test_invalid_fields_rejected_before_connecting() {
        let manager = DeviceManager::new();
        let fields: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({"LRL": "sixty"})).unwrap();
        let result = program_parameters(&manager, "VVI", &fields).await;
        assert!(!result.success);
        assert!(result.message.starts_with("Invalid parameters"));
    }

    #[tokio::test]
    async fn test_simulator_session() {
        let manager = DeviceManager::new();
        let settings = AppSettings::default();
        assert!(connect_simulator(&manager, &settings).await.success);

        let fields: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({"LRL": 70})).unwrap();
        let result = echo_test(&manager, "AAI", &fields).await;
        assert!(result.success, "{}", result.message);

        let display = interrogate_display(&manager).await.data.unwrap();
        assert_eq!(display.lower_rate_limit, 70.0);

        assert!(disconnect_device(&manager).await.success);
        assert!(disconnect_device(&manager).await.success);
    }

    #[tokio::test]
    async fn test_signals_with_default_settings() {
        let manager = DeviceManager::new();
        assert!(connect_simulator(&manager, &AppSettings::default()).await.success);

        let result = get_signals(&manager).await;
        assert!(result.success, "{}", result.message);
        let frame = result.data.unwrap();
        assert_eq!(frame.ventricular[1], (0.25f32).sin() * 2.0);

        let result = interrogate_device(&manager).await;
        assert!(!result.success);
        assert!(result.message.contains("response type is 0"), "{}", result.message);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_create_profile_validates_ranges() {
        let manager = DeviceManager::new();
        let parameters = DisplayParameters {
            lower_rate_limit: 10.0,
            ..DisplayParameters::default()
        };
        let result = create_profile(&manager, "slow", PacingMode::Aoo, parameters).await;
        assert!(!result.success);

        let result = create_profile(&manager, "nominal", PacingMode::Aoo, DisplayParameters::default()).await;
        assert!(result.success);
        assert!(get_profile(&manager, "NOMINAL").await.success);
    }

    #[tokio::test]
    async fn test_update_profile_keeps_mode_and_checks_ranges() {
        let manager = DeviceManager::new();
        let created = create_profile(&manager, "rest", PacingMode::Vvi, DisplayParameters::default())
            .await
            .data
            .unwrap();

        let slower = DisplayParameters {
            lower_rate_limit: 50.0,
            ..DisplayParameters::default()
        };
        let updated = update_profile(&manager, &created.id, slower).await;
        assert!(updated.success, "{}", updated.message);
        let updated = updated.data.unwrap();
        assert_eq!(updated.mode, PacingMode::Vvi);
        assert_eq!(updated.parameters.lower_rate_limit, 50.0);
        assert!(updated.modified_at >= created.modified_at);

        let invalid = DisplayParameters {
            lower_rate_limit: 10.0,
            ..DisplayParameters::default()
        };
        assert!(!update_profile(&manager, &created.id, invalid).await.success);
        assert!(!update_profile(&manager, "missing", DisplayParameters::default()).await.success);

        let stored = get_profile(&manager, "rest").await.data.unwrap();
        assert_eq!(stored.parameters.lower_rate_limit, 50.0);
    }
}
