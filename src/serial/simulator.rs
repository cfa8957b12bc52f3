use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::interface::Transport;
use super::protocol::{
    ProtocolVariant, ACK, CMD_ECHO, CMD_GET_EGM, CMD_GET_PARAMS, CMD_SET_PARAMS, DEVICE_ID_LEN, NACK, SYNC,
};
use super::{Result, SerialError};
use crate::params::binary::{self, SignalFrame, PAYLOAD_LEN, RESPONSE_LEN, SIGNAL_SAMPLES};
use crate::params::{Field, ParameterRecord, RESPONSE_TYPE_SIGNALS};

pub const SIMULATOR_NAME: &str = "simulator";
const DEFAULT_DEVICE_ID: &str = "SIM-PACEMAKER";

/// One-shot misbehaviour applied to the next response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Send nothing
    Silent,
    /// Send only the first n bytes
    Truncate(usize),
    /// Replace the sync byte
    BadSync,
    /// Answer `[SYNC][NACK]` and nothing else
    Nack,
    /// Take the next request, then drop the link without answering
    Unplug,
}

struct SimState {
    variant: ProtocolVariant,
    device_id: String,
    open: bool,
    stored: ParameterRecord,
    overrides: Vec<(Field, serde_json::Value)>,
    pending: Option<Fault>,
    outbound: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    tick: u64,
}

/// In-memory pacemaker firmware.
///
/// Clones share state, so a test can keep a handle after moving one into the
/// protocol engine.
#[derive(Clone)]
pub struct SimulatedPacemaker {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPacemaker {
    pub fn new(variant: ProtocolVariant) -> Self {
        Self {
            name: SIMULATOR_NAME.to_string(),
            state: Arc::new(Mutex::new(SimState {
                variant,
                device_id: DEFAULT_DEVICE_ID.to_string(),
                open: true,
                stored: ParameterRecord::default(),
                overrides: Vec::new(),
                pending: None,
                outbound: VecDeque::new(),
                sent: Vec::new(),
                tick: 0,
            })),
        }
    }

    pub fn with_device_id(self, device_id: &str) -> Self {
        self.lock().device_id = device_id.to_string();
        self
    }

    /// Start from `record` instead of the defaults
    pub fn with_parameters(self, record: ParameterRecord) -> Self {
        self.lock().stored = record;
        self
    }

    /// Report `value` for `field` on every readback, whatever was programmed
    pub fn with_readback_override(self, field: Field, value: impl Into<serde_json::Value>) -> Self {
        self.lock().overrides.push((field, value.into()));
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().pending = Some(fault);
    }

    /// Every frame received so far, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    pub fn stored_parameters(&self) -> ParameterRecord {
        self.lock().stored
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimState {
    fn parameter_response(&self) -> Vec<u8> {
        let mut record = self.stored;
        for (field, value) in &self.overrides {
            if let Err(e) = record.set(*field, value) {
                log::warn!("Ignoring readback override for {}: {}", field.name(), e);
            }
        }
        let mut response = vec![0u8; RESPONSE_LEN];
        response[..PAYLOAD_LEN].copy_from_slice(&binary::encode(record.pacing_mode(), &record));
        response[1] = record.mode;
        response
    }

    fn signal_response(&mut self) -> Vec<u8> {
        let mut frame = SignalFrame {
            ventricular: [0.0; SIGNAL_SAMPLES],
            atrial: [0.0; SIGNAL_SAMPLES],
        };
        for i in 0..SIGNAL_SAMPLES {
            let t = (self.tick * SIGNAL_SAMPLES as u64 + i as u64) as f32 * 0.25;
            frame.ventricular[i] = t.sin() * 2.0;
            frame.atrial[i] = (t + 1.0).sin() * 0.8;
        }
        self.tick += 1;
        binary::encode_signals(&frame).to_vec()
    }

    fn acknowledged(body: Vec<u8>) -> Vec<u8> {
        let mut framed = Vec::with_capacity(body.len() + 2);
        framed.extend_from_slice(&[SYNC, ACK]);
        framed.extend(body);
        framed
    }

    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 2 || frame[0] != SYNC {
            log::warn!("Simulator dropped unframed request {}", hex::encode(frame));
            return None;
        }

        match (frame[1], self.variant) {
            (CMD_SET_PARAMS, variant) if frame.len() == 2 + PAYLOAD_LEN => {
                match binary::decode(&frame[2..]) {
                    Ok(record) => self.stored = record,
                    Err(e) => log::warn!("Simulator rejected payload: {}", e),
                }
                match variant {
                    ProtocolVariant::Optimistic => None,
                    ProtocolVariant::Acknowledged => Some(vec![SYNC, ACK]),
                }
            }
            (CMD_ECHO, ProtocolVariant::Acknowledged) => {
                let mut id = self.device_id.clone().into_bytes();
                id.resize(DEVICE_ID_LEN, 0);
                Some(Self::acknowledged(id))
            }
            (CMD_ECHO, ProtocolVariant::Optimistic) => {
                if self.stored.response_type == RESPONSE_TYPE_SIGNALS {
                    Some(self.signal_response())
                } else {
                    Some(self.parameter_response())
                }
            }
            (CMD_GET_PARAMS, ProtocolVariant::Acknowledged) => Some(Self::acknowledged(self.parameter_response())),
            (CMD_GET_EGM, ProtocolVariant::Acknowledged) => {
                let body = self.signal_response();
                Some(Self::acknowledged(body))
            }
            (command, _) => {
                log::warn!("Simulator ignoring command 0x{:02X}", command);
                None
            }
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        self.sent.push(frame.to_vec());

        if self.pending == Some(Fault::Unplug) {
            self.pending = None;
            self.respond(frame);
            self.open = false;
            self.outbound.clear();
            return;
        }

        let Some(mut response) = self.respond(frame) else {
            return;
        };
        match self.pending.take() {
            None => {}
            Some(Fault::Silent) => return,
            Some(Fault::Truncate(n)) => response.truncate(n),
            Some(Fault::BadSync) => {
                if let Some(first) = response.first_mut() {
                    *first = 0xFF;
                }
            }
            Some(Fault::Nack) => response = vec![SYNC, NACK],
            Some(Fault::Unplug) => return,
        }
        self.outbound.extend(response);
    }
}

#[async_trait]
impl Transport for SimulatedPacemaker {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(SerialError::NotConnected);
        }
        state.handle(data);
        Ok(data.len())
    }

    // Responses are queued synchronously, so a short read never needs to wait.
    async fn read_data(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(SerialError::NotConnected);
        }
        let n = buffer.len().min(state.outbound.len());
        for (slot, byte) in buffer.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(SerialError::NotConnected);
        }
        state.outbound.clear();
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.open = false;
        state.outbound.clear();
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PacingMode;

    #[tokio::test]
    async fn test_stores_programmed_payload() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        let record = ParameterRecord {
            lrl: 75,
            ..ParameterRecord::default()
        };
        let mut frame = vec![SYNC, CMD_SET_PARAMS];
        frame.extend_from_slice(&binary::encode(PacingMode::Aai, &record));
        sim.send_data(&frame).await.unwrap();

        let stored = sim.stored_parameters();
        assert_eq!(stored.lrl, 75);
        assert_eq!(stored.pacing_mode(), PacingMode::Aai);
    }

    #[tokio::test]
    async fn test_readback_override_applies() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged).with_readback_override(Field::Vrp, 300);
        sim.send_data(&[SYNC, CMD_GET_PARAMS]).await.unwrap();
        let mut buf = [0u8; 90];
        assert_eq!(sim.read_data(&mut buf, Duration::ZERO).await.unwrap(), 90);
        assert_eq!(&buf[..2], &[SYNC, ACK]);
        assert_eq!(binary::decode(&buf[2..]).unwrap().vrp, 300);
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
        sim.inject(Fault::Truncate(10));
        sim.send_data(&[SYNC, CMD_GET_EGM]).await.unwrap();
        let mut buf = [0u8; 90];
        assert_eq!(sim.read_data(&mut buf, Duration::ZERO).await.unwrap(), 10);

        sim.send_data(&[SYNC, CMD_GET_EGM]).await.unwrap();
        assert_eq!(sim.read_data(&mut buf, Duration::ZERO).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn test_unplug_stores_then_closes() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        sim.inject(Fault::Unplug);
        let record = ParameterRecord {
            lrl: 90,
            ..ParameterRecord::default()
        };
        let mut frame = vec![SYNC, CMD_SET_PARAMS];
        frame.extend_from_slice(&binary::encode(PacingMode::Voo, &record));
        sim.send_data(&frame).await.unwrap();

        assert_eq!(sim.stored_parameters().lrl, 90);
        assert!(!sim.is_open());
        assert!(matches!(sim.clear_input(), Err(SerialError::NotConnected)));
    }

    #[tokio::test]
    async fn test_closed_simulator_refuses_io() {
        let mut sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
        sim.close();
        assert!(!sim.is_open());
        assert!(matches!(sim.send_data(&[SYNC]).await, Err(SerialError::NotConnected)));
    }
}
