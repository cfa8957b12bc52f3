use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::interface::{Transport, BAUD_RATE, DEFAULT_TIMEOUT};
use super::verify::{self, EchoVerification};
use super::{Result, SerialError, SerialInterface, SerialPortInfo};
use crate::params::binary::{self, SignalFrame, PAYLOAD_LEN, RESPONSE_LEN};
use crate::params::{PacingMode, ParameterRecord, RESPONSE_TYPE_PARAMETERS, RESPONSE_TYPE_SIGNALS};

pub const SYNC: u8 = 0x16;
pub const CMD_ECHO: u8 = 0x22;
pub const CMD_SET_PARAMS: u8 = 0x55;
pub const CMD_GET_PARAMS: u8 = 0x56;
pub const CMD_GET_EGM: u8 = 0x57;
pub const ACK: u8 = 0x06;
pub const NACK: u8 = 0x15;

/// ASCII device id returned by the acknowledged handshake, NUL padded
pub const DEVICE_ID_LEN: usize = 16;
const PREFIX_LEN: usize = 2;

/// Wire protocol revision spoken by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// Fire-and-forget programming, unprefixed 88-byte responses
    #[default]
    Optimistic,
    /// Every response is prefixed with `[SYNC][ACK|NACK]`
    Acknowledged,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Optimistic => f.write_str("optimistic"),
            ProtocolVariant::Acknowledged => f.write_str("acknowledged"),
        }
    }
}

impl FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "optimistic" => Ok(ProtocolVariant::Optimistic),
            "acknowledged" | "ack" => Ok(ProtocolVariant::Acknowledged),
            _ => Err(format!("Unknown protocol variant: {}", s)),
        }
    }
}

/// Fixed delays around each exchange; the firmware needs time to settle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolTiming {
    pub connect_settle: Duration,
    pub program_settle: Duration,
    pub clear_pause: Duration,
    pub pre_read_pause: Duration,
    pub echo_settle: Duration,
    pub echo_post_clear: Duration,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            connect_settle: Duration::from_millis(1000),
            program_settle: Duration::from_millis(100),
            clear_pause: Duration::from_millis(50),
            pre_read_pause: Duration::from_millis(100),
            echo_settle: Duration::from_millis(300),
            echo_post_clear: Duration::from_millis(100),
        }
    }
}

impl ProtocolTiming {
    /// No delays, for simulated devices
    pub fn immediate() -> Self {
        Self {
            connect_settle: Duration::ZERO,
            program_settle: Duration::ZERO,
            clear_pause: Duration::ZERO,
            pre_read_pause: Duration::ZERO,
            echo_settle: Duration::ZERO,
            echo_post_clear: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolConfig {
    pub variant: ProtocolVariant,
    pub read_timeout: Duration,
    pub timing: ProtocolTiming,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::default(),
            read_timeout: DEFAULT_TIMEOUT,
            timing: ProtocolTiming::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    AwaitingEcho,
    Connected,
    Programming,
    Interrogating,
    Streaming,
    Disconnected,
}

/// Pacemaker command/response protocol over a single owned transport.
///
/// Every request starts with [`SYNC`]. The engine never resynchronizes: a
/// misaligned response fails the call and the caller decides whether to retry.
///
/// The optimistic firmware answers the echo request according to the
/// `response_type` it last stored, so the engine remembers that value.
pub struct PacemakerProtocol {
    interface: Box<dyn Transport>,
    config: ProtocolConfig,
    state: EngineState,
    device_id: Option<String>,
    response_type: Option<u8>,
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn check_prefix(prefix: &[u8]) -> Result<()> {
    if prefix[0] != SYNC {
        return Err(SerialError::ProtocolMismatch(format!(
            "expected sync byte 0x{:02X}, got 0x{:02X}",
            SYNC, prefix[0]
        )));
    }
    match prefix[1] {
        ACK => Ok(()),
        NACK => Err(SerialError::Nack),
        other => Err(SerialError::ProtocolMismatch(format!(
            "expected ACK/NACK, got 0x{:02X}",
            other
        ))),
    }
}

impl PacemakerProtocol {
    pub fn new(interface: Box<dyn Transport>, config: ProtocolConfig) -> Self {
        Self {
            interface,
            config,
            state: EngineState::Idle,
            device_id: None,
            response_type: None,
        }
    }

    /// Enumerate serial endpoints as (port, description) pairs
    pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
        SerialInterface::list_ports()
    }

    /// Port of the attached debug probe, if any
    pub fn find_marked_port() -> Result<Option<String>> {
        Ok(SerialInterface::find_marked_port(&SerialInterface::list_ports()?))
    }

    /// Open `port` and bring the link up
    pub async fn connect(port: &str, baud_rate: Option<u32>, timeout: Duration, config: ProtocolConfig) -> Result<Self> {
        let mut interface = SerialInterface::new();
        interface.connect(port, baud_rate.unwrap_or(BAUD_RATE), timeout)?;
        Self::establish(Box::new(interface), config).await
    }

    /// Settle, verify and handshake over an already opened transport.
    /// The transport is closed again if any step fails.
    pub async fn establish(interface: Box<dyn Transport>, config: ProtocolConfig) -> Result<Self> {
        let mut protocol = Self::new(interface, config);
        protocol.state = EngineState::AwaitingEcho;

        pause(config.timing.connect_settle).await;

        let result = if protocol.interface.is_open() {
            protocol.handshake().await
        } else {
            Err(SerialError::ConnectionFailed("port did not report open".to_string()))
        };

        match result {
            Ok(device_id) => {
                log::info!(
                    "Connected to pacemaker '{}' on {} ({} protocol)",
                    device_id,
                    protocol.interface.name(),
                    config.variant
                );
                protocol.device_id = Some(device_id);
                protocol.state = EngineState::Connected;
                Ok(protocol)
            }
            Err(e) => {
                log::error!("Handshake with {} failed: {}", protocol.interface.name(), e);
                protocol.disconnect();
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<String> {
        match self.config.variant {
            ProtocolVariant::Optimistic => Ok(self.interface.name().to_string()),
            ProtocolVariant::Acknowledged => {
                self.interface.clear_input()?;
                self.send_frame(&[SYNC, CMD_ECHO]).await?;
                let reply = self.read_prefixed(DEVICE_ID_LEN).await?;
                let id = String::from_utf8_lossy(&reply)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                if id.is_empty() {
                    Ok(self.interface.name().to_string())
                } else {
                    Ok(id)
                }
            }
        }
    }

    /// Close the transport. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) {
        if self.interface.is_open() {
            self.interface.close();
        }
        self.device_id = None;
        self.response_type = None;
        self.state = EngineState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.state == EngineState::Connected && self.interface.is_open()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn port_name(&self) -> &str {
        self.interface.name()
    }

    /// Response type the device is known to hold, if any
    pub fn response_type(&self) -> Option<u8> {
        self.response_type
    }

    fn begin(&mut self, state: EngineState) -> Result<()> {
        if !self.is_connected() {
            return Err(SerialError::NotConnected);
        }
        self.state = state;
        Ok(())
    }

    // Transport failures break the link; everything else leaves it usable.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                log::error!("Transport failure on {}, closing: {}", self.interface.name(), e);
                self.disconnect();
            }
            Err(e) => {
                log::warn!("Request failed: {}", e);
                self.state = EngineState::Connected;
            }
            Ok(_) => self.state = EngineState::Connected,
        }
        result
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        log::debug!("TX [{}] {}", frame.len(), hex::encode(frame));
        self.interface.send_data(frame).await?;
        Ok(())
    }

    async fn read_exact(&mut self, len: usize, expected_total: usize, already: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.interface.read_data(&mut buf, self.config.read_timeout).await?;
        log::debug!("RX [{}] {}", n, hex::encode(&buf[..n]));
        if n < len {
            return Err(SerialError::IncompleteData {
                expected: expected_total,
                actual: already + n,
            });
        }
        Ok(buf)
    }

    /// Read `[SYNC][ACK]` followed by `payload_len` bytes
    async fn read_prefixed(&mut self, payload_len: usize) -> Result<Vec<u8>> {
        let total = PREFIX_LEN + payload_len;
        let prefix = self.read_exact(PREFIX_LEN, total, 0).await?;
        check_prefix(&prefix)?;
        if payload_len == 0 {
            return Ok(Vec::new());
        }
        self.read_exact(payload_len, total, PREFIX_LEN).await
    }

    /// Request frame for a readback, per protocol variant
    fn readback_request(&self, command: u8) -> Vec<u8> {
        match self.config.variant {
            ProtocolVariant::Optimistic => {
                let mut frame = vec![SYNC, CMD_ECHO];
                frame.extend_from_slice(&[0u8; PAYLOAD_LEN]);
                frame
            }
            ProtocolVariant::Acknowledged => vec![SYNC, command],
        }
    }

    async fn request_response(&mut self, command: u8) -> Result<Vec<u8>> {
        self.interface.clear_input()?;
        pause(self.config.timing.clear_pause).await;

        let frame = self.readback_request(command);
        self.send_frame(&frame).await?;
        pause(self.config.timing.pre_read_pause).await;

        match self.config.variant {
            ProtocolVariant::Optimistic => self.read_exact(RESPONSE_LEN, RESPONSE_LEN, 0).await,
            ProtocolVariant::Acknowledged => self.read_prefixed(RESPONSE_LEN).await,
        }
    }

    /// Write a full parameter set. The `mode` argument overrides `record.mode`.
    pub async fn program_parameters(&mut self, mode: PacingMode, record: &ParameterRecord) -> Result<()> {
        self.begin(EngineState::Programming)?;
        let result = self.program_inner(mode, record).await;
        self.finish(result)
    }

    async fn program_inner(&mut self, mode: PacingMode, record: &ParameterRecord) -> Result<()> {
        // Leftovers from a failed readback would otherwise be read as the ACK
        self.interface.clear_input()?;
        pause(self.config.timing.clear_pause).await;

        let mut frame = Vec::with_capacity(PREFIX_LEN + PAYLOAD_LEN);
        frame.extend_from_slice(&[SYNC, CMD_SET_PARAMS]);
        frame.extend_from_slice(&binary::encode(mode, record));
        self.send_frame(&frame).await?;

        match self.config.variant {
            ProtocolVariant::Optimistic => {
                // No acknowledgment exists; assume the device took it
                pause(self.config.timing.program_settle).await;
            }
            ProtocolVariant::Acknowledged => {
                self.read_prefixed(0).await?;
            }
        }
        self.response_type = Some(record.response_type);
        log::info!("Programmed {} parameters", mode);
        Ok(())
    }

    /// Coerce and program loosely typed fields. Encoding errors surface before any I/O.
    pub async fn program_fields(&mut self, mode: &str, fields: &BTreeMap<String, serde_json::Value>) -> Result<ParameterRecord> {
        let mode = PacingMode::from_symbol(mode);
        let record = ParameterRecord::from_fields(mode, fields)?;
        self.program_parameters(mode, &record).await?;
        Ok(record)
    }

    /// Read back the device's full parameter state
    pub async fn interrogate_device(&mut self) -> Result<ParameterRecord> {
        self.begin(EngineState::Interrogating)?;
        let result = self.read_parameters().await;
        self.finish(result)
    }

    async fn read_parameters(&mut self) -> Result<ParameterRecord> {
        if self.config.variant == ProtocolVariant::Acknowledged {
            let data = self.request_response(CMD_GET_PARAMS).await?;
            return binary::decode(&data);
        }

        if let Some(actual) = self.response_type.filter(|t| *t != RESPONSE_TYPE_PARAMETERS) {
            return Err(SerialError::ResponseMode {
                expected: RESPONSE_TYPE_PARAMETERS,
                actual,
            });
        }
        let data = self.request_response(CMD_GET_PARAMS).await?;
        if data[0] != RESPONSE_TYPE_PARAMETERS {
            return Err(SerialError::ProtocolMismatch(format!(
                "expected parameter echo (response type {}), got 0x{:02X}",
                RESPONSE_TYPE_PARAMETERS, data[0]
            )));
        }
        self.response_type = Some(RESPONSE_TYPE_PARAMETERS);
        binary::decode(&data)
    }

    /// One 11-sample frame per channel
    pub async fn get_signals(&mut self) -> Result<SignalFrame> {
        self.begin(EngineState::Streaming)?;
        let result = match self.config.variant {
            ProtocolVariant::Optimistic => self.optimistic_signals().await,
            ProtocolVariant::Acknowledged => match self.request_response(CMD_GET_EGM).await {
                Ok(data) => binary::decode_signals(&data),
                Err(e) => Err(e),
            },
        };
        self.finish(result)
    }

    /// Streaming starts by reprogramming the current record with response type 0.
    /// A device found already streaming answers the first request with a frame.
    async fn optimistic_signals(&mut self) -> Result<SignalFrame> {
        if self.response_type != Some(RESPONSE_TYPE_SIGNALS) {
            let data = self.request_response(CMD_GET_EGM).await?;
            if data[0] != RESPONSE_TYPE_PARAMETERS {
                self.response_type = Some(RESPONSE_TYPE_SIGNALS);
                return binary::decode_signals(&data);
            }

            let current = binary::decode(&data)?;
            let streaming = ParameterRecord {
                response_type: RESPONSE_TYPE_SIGNALS,
                ..current
            };
            self.program_inner(current.pacing_mode(), &streaming).await?;
            log::info!("Switched {} to signal streaming", self.interface.name());
        }

        let data = self.request_response(CMD_GET_EGM).await?;
        binary::decode_signals(&data)
    }

    /// Program, read back and compare. Failures are reported in the result.
    pub async fn echo_test_parameters(&mut self, mode: PacingMode, record: &ParameterRecord) -> EchoVerification {
        let sent = record.with_mode(mode);

        if let Err(e) = self.program_parameters(mode, &sent).await {
            return EchoVerification::failed(format!("Programming failed: {}", e));
        }

        pause(self.config.timing.echo_settle).await;
        let cleared = self.interface.clear_input();
        if let Err(e) = self.finish(cleared) {
            return EchoVerification::failed(format!("Interrogate failed: {}", e));
        }
        pause(self.config.timing.echo_post_clear).await;

        match self.interrogate_device().await {
            Ok(received) => verify::compare_records(mode, &sent, &received),
            Err(e) => EchoVerification::failed(format!("Interrogate failed: {}", e)),
        }
    }
}

impl Drop for PacemakerProtocol {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::simulator::{Fault, SimulatedPacemaker};

    fn config(variant: ProtocolVariant) -> ProtocolConfig {
        ProtocolConfig {
            variant,
            read_timeout: Duration::from_millis(20),
            timing: ProtocolTiming::immediate(),
        }
    }

    #[test]
    fn test_check_prefix() {
        assert!(check_prefix(&[SYNC, ACK]).is_ok());
        assert!(matches!(check_prefix(&[SYNC, NACK]), Err(SerialError::Nack)));
        assert!(matches!(check_prefix(&[0x00, ACK]), Err(SerialError::ProtocolMismatch(_))));
        assert!(matches!(check_prefix(&[SYNC, 0x42]), Err(SerialError::ProtocolMismatch(_))));
    }

    #[test]
    fn test_variant_parsing() {
        assert_eq!("ack".parse::<ProtocolVariant>().unwrap(), ProtocolVariant::Acknowledged);
        assert_eq!("Optimistic".parse::<ProtocolVariant>().unwrap(), ProtocolVariant::Optimistic);
        assert!("v3".parse::<ProtocolVariant>().is_err());
    }

    #[tokio::test]
    async fn test_optimistic_program_writes_single_frame() {
        let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        let mut protocol = PacemakerProtocol::establish(Box::new(sim.clone()), config(ProtocolVariant::Optimistic))
            .await
            .unwrap();
        assert_eq!(protocol.device_id(), Some("simulator"));

        protocol
            .program_parameters(PacingMode::Vvi, &ParameterRecord::default())
            .await
            .unwrap();

        let sent = sim.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 34);
        assert_eq!(&sent[0][..2], &[SYNC, CMD_SET_PARAMS]);
        assert_eq!(sent[0][3], PacingMode::Vvi.code());
    }

    #[tokio::test]
    async fn test_acknowledged_handshake_reads_device_id() {
        let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged).with_device_id("PM-K64F-01");
        let protocol = PacemakerProtocol::establish(Box::new(sim.clone()), config(ProtocolVariant::Acknowledged))
            .await
            .unwrap();
        assert_eq!(protocol.device_id(), Some("PM-K64F-01"));
        assert_eq!(protocol.state(), EngineState::Connected);
        assert_eq!(sim.sent_frames()[0], vec![SYNC, CMD_ECHO]);
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_transport() {
        let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
        sim.inject(Fault::Silent);
        let result = PacemakerProtocol::establish(Box::new(sim.clone()), config(ProtocolVariant::Acknowledged)).await;
        assert!(matches!(result, Err(SerialError::IncompleteData { expected: 18, actual: 0 })));
        assert!(!sim.is_open());
    }

    #[tokio::test]
    async fn test_closed_port_fails_connect() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        sim.close();
        let result = PacemakerProtocol::establish(Box::new(sim), config(ProtocolVariant::Optimistic)).await;
        assert!(matches!(result, Err(SerialError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        let mut protocol = PacemakerProtocol::establish(Box::new(sim.clone()), config(ProtocolVariant::Optimistic))
            .await
            .unwrap();
        protocol.disconnect();
        protocol.disconnect();
        assert_eq!(protocol.state(), EngineState::Disconnected);
        assert!(protocol.device_id().is_none());
        assert!(!sim.is_open());

        let err = protocol.interrogate_device().await.unwrap_err();
        assert!(matches!(err, SerialError::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_fields_fail_before_io() {
        let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        let mut protocol = PacemakerProtocol::establish(Box::new(sim.clone()), config(ProtocolVariant::Optimistic))
            .await
            .unwrap();
        let fields: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(r#"{"LRL": 60, "URL": "fast"}"#).unwrap();
        let err = protocol.program_fields("VVI", &fields).await.unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { .. }));
        assert!(sim.sent_frames().is_empty());
        assert!(protocol.is_connected());
    }
}
