use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::params::{PacingMode, ParameterRecord, SignalFrame};
use crate::serial::{
    self, EchoVerification, PacemakerProtocol, ProtocolConfig, SerialPortInfo, Transport,
};
use super::{AppSettings, ConnectionState, Device, DeviceError, ProfileManager, Result};

/// Central device management system.
/// Owns the single pacemaker connection and serializes every request on it.
pub struct DeviceManager {
    device: Arc<RwLock<Option<Device>>>,
    connected_device: Arc<Mutex<Option<(Uuid, PacemakerProtocol)>>>,
    profile_manager: Arc<Mutex<ProfileManager>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_profiles(ProfileManager::new())
    }

    pub fn with_profiles(profiles: ProfileManager) -> Self {
        Self {
            device: Arc::new(RwLock::new(None)),
            connected_device: Arc::new(Mutex::new(None)),
            profile_manager: Arc::new(Mutex::new(profiles)),
        }
    }

    pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
        Ok(PacemakerProtocol::list_ports()?)
    }

    pub fn find_marked_port() -> Result<Option<String>> {
        Ok(PacemakerProtocol::find_marked_port()?)
    }

    /// Open `port_name` with the given settings and handshake
    pub async fn connect(&self, port_name: &str, settings: &AppSettings) -> Result<Device> {
        let timeout = settings.connect_timeout();
        let baud_rate = settings.baud_rate;
        let config = settings.protocol_config();
        self.bring_up(
            port_name,
            PacemakerProtocol::connect(port_name, Some(baud_rate), timeout, config),
        )
        .await
    }

    /// Bring up a connection over an already opened transport
    pub async fn attach(&self, port_name: &str, transport: Box<dyn Transport>, config: ProtocolConfig) -> Result<Device> {
        self.bring_up(port_name, PacemakerProtocol::establish(transport, config))
            .await
    }

    async fn bring_up<F>(&self, port_name: &str, open: F) -> Result<Device>
    where
        F: Future<Output = serial::Result<PacemakerProtocol>>,
    {
        // Held across the handshake so concurrent connects cannot both succeed
        let mut connected_guard = self.connected_device.lock().await;
        if connected_guard.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }

        let mut device = Device::new(port_name.to_string());
        device.update_connection_state(ConnectionState::Connecting);
        let device_id = device.id;
        *self.device.write().await = Some(device);

        log::info!("Attempting to connect to port: {}", port_name);
        match open.await {
            Ok(protocol) => {
                let firmware_id = protocol.device_id().map(str::to_string);
                *connected_guard = Some((device_id, protocol));

                let mut device_guard = self.device.write().await;
                let device = device_guard.get_or_insert_with(|| Device::new(port_name.to_string()));
                device.device_id = firmware_id;
                device.update_connection_state(ConnectionState::Connected);

                log::info!("Successfully connected to device: {}", port_name);
                Ok(device.clone())
            }
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                self.update_device_connection_state(ConnectionState::Error(error_msg)).await;
                Err(DeviceError::SerialError(e))
            }
        }
    }

    /// Disconnect from the current device. A no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<()> {
        let mut connected_guard = self.connected_device.lock().await;

        if let Some((_, mut protocol)) = connected_guard.take() {
            protocol.disconnect();
            self.update_device_connection_state(ConnectionState::Disconnected).await;
            log::info!("Disconnected from device");
        } else {
            log::debug!("Disconnect requested with no device connected");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        let connected_guard = self.connected_device.lock().await;
        connected_guard.is_some()
    }

    /// Snapshot of the current (or last) device
    pub async fn device(&self) -> Option<Device> {
        self.device.read().await.clone()
    }

    /// Execute a command on the connected device.
    /// A transport failure inside `f` drops the connection.
    pub async fn execute_with_protocol<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut PacemakerProtocol) -> std::pin::Pin<Box<dyn Future<Output = Result<R>> + Send + '_>>,
        R: Send,
    {
        let mut connected_guard = self.connected_device.lock().await;

        let Some((_, protocol)) = connected_guard.as_mut() else {
            return Err(DeviceError::NotConnected);
        };

        let result = f(protocol).await;

        if !protocol.is_connected() {
            log::warn!("Connection to {} lost", protocol.port_name());
            *connected_guard = None;
            let state = match &result {
                Err(e) => ConnectionState::Error(e.to_string()),
                Ok(_) => ConnectionState::Disconnected,
            };
            self.update_device_connection_state(state).await;
        } else {
            self.touch().await;
        }
        result
    }

    /// Program a full parameter set
    pub async fn program(&self, mode: PacingMode, record: &ParameterRecord) -> Result<()> {
        let record = *record;
        self.execute_with_protocol(|protocol| {
            Box::pin(async move {
                protocol.program_parameters(mode, &record).await
                    .map_err(DeviceError::SerialError)
            })
        }).await
    }

    /// Read back the device's parameters and remember them
    pub async fn interrogate(&self) -> Result<ParameterRecord> {
        let record = self.execute_with_protocol(|protocol| {
            Box::pin(async move {
                protocol.interrogate_device().await
                    .map_err(DeviceError::SerialError)
            })
        }).await?;

        if let Some(device) = self.device.write().await.as_mut() {
            device.update_parameters(record);
        }
        Ok(record)
    }

    pub async fn get_signals(&self) -> Result<SignalFrame> {
        self.execute_with_protocol(|protocol| {
            Box::pin(async move {
                protocol.get_signals().await
                    .map_err(DeviceError::SerialError)
            })
        }).await
    }

    /// Program and verify by readback
    pub async fn echo_test(&self, mode: PacingMode, record: &ParameterRecord) -> Result<EchoVerification> {
        let record = *record;
        self.execute_with_protocol(|protocol| {
            Box::pin(async move {
                Ok::<_, DeviceError>(protocol.echo_test_parameters(mode, &record).await)
            })
        }).await
    }

    /// Get profile manager
    pub async fn get_profile_manager(&self) -> ProfileManager {
        let profile_guard = self.profile_manager.lock().await;
        profile_guard.clone()
    }

    /// Update profile manager
    pub async fn update_profile_manager<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ProfileManager) -> Result<R>,
    {
        let mut profile_guard = self.profile_manager.lock().await;
        f(&mut profile_guard)
    }

    pub async fn load_profiles(&self, path: &Path) -> Result<usize> {
        let loaded = ProfileManager::load(path)?;
        let count = loaded.profiles.len();
        *self.profile_manager.lock().await = loaded;
        Ok(count)
    }

    pub async fn save_profiles(&self, path: &Path) -> Result<()> {
        let profile_guard = self.profile_manager.lock().await;
        profile_guard.save(path)
    }

    /// Helper method to update device connection state
    async fn update_device_connection_state(&self, state: ConnectionState) {
        let mut device_guard = self.device.write().await;
        if let Some(device) = device_guard.as_mut() {
            device.update_connection_state(state);
        }
    }

    async fn touch(&self) {
        if let Some(device) = self.device.write().await.as_mut() {
            device.last_seen = chrono::Utc::now();
        }
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
