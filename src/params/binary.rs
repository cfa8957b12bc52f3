use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{PacingMode, ParameterRecord};
use crate::serial::{Result, SerialError};

/// Parameter payload length; same for every pacing mode
pub const PAYLOAD_LEN: usize = 32;
/// Interrogation and signal responses are always this long
pub const RESPONSE_LEN: usize = 88;
/// Samples per channel in one signal frame
pub const SIGNAL_SAMPLES: usize = 11;

// Byte offsets within the payload. The interrogation response carries the
// same layout at offset 0; bytes 32..88 of the response are reserved.
const OFF_RESPONSE_TYPE: usize = 0;
const OFF_MODE: usize = 1;
const OFF_ARP: usize = 2;
const OFF_VRP: usize = 4;
const OFF_ATR_PULSE_AMP: usize = 6;
const OFF_VENT_PULSE_AMP: usize = 10;
const OFF_ATR_PULSE_WIDTH: usize = 14;
const OFF_VENT_PULSE_WIDTH: usize = 16;
// 18 reserved
const OFF_ATR_CMP_REF_PWM: usize = 19;
const OFF_VENT_CMP_REF_PWM: usize = 20;
const OFF_REACTION_TIME: usize = 21;
const OFF_RECOVERY_TIME: usize = 23;
// 25 reserved
const OFF_FIXED_AV_DELAY: usize = 26;
const OFF_RESPONSE_FACTOR: usize = 27;
const OFF_ACTIVITY_THRESHOLD: usize = 28;
const OFF_LRL: usize = 29;
const OFF_URL: usize = 30;
const OFF_MSR: usize = 31;

/// One electrogram read: 11 samples per channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    pub ventricular: [f32; SIGNAL_SAMPLES],
    pub atrial: [f32; SIGNAL_SAMPLES],
}

/// Encode a record for `CMD_SET_PARAMS`. The mode argument overrides `record.mode`.
pub fn encode(mode: PacingMode, record: &ParameterRecord) -> [u8; PAYLOAD_LEN] {
    let mut buf = [0u8; PAYLOAD_LEN];

    buf[OFF_RESPONSE_TYPE] = record.response_type;
    buf[OFF_MODE] = mode.code();
    put_u16(&mut buf, OFF_ARP, record.arp);
    put_u16(&mut buf, OFF_VRP, record.vrp);
    put_f32(&mut buf, OFF_ATR_PULSE_AMP, record.atr_pulse_amp);
    put_f32(&mut buf, OFF_VENT_PULSE_AMP, record.vent_pulse_amp);
    put_u16(&mut buf, OFF_ATR_PULSE_WIDTH, record.atr_pulse_width);
    put_u16(&mut buf, OFF_VENT_PULSE_WIDTH, record.vent_pulse_width);
    buf[OFF_ATR_CMP_REF_PWM] = record.atr_cmp_ref_pwm;
    buf[OFF_VENT_CMP_REF_PWM] = record.vent_cmp_ref_pwm;
    put_u16(&mut buf, OFF_REACTION_TIME, record.reaction_time);
    put_u16(&mut buf, OFF_RECOVERY_TIME, record.recovery_time);
    buf[OFF_FIXED_AV_DELAY] = record.fixed_av_delay;
    buf[OFF_RESPONSE_FACTOR] = record.response_factor;
    buf[OFF_ACTIVITY_THRESHOLD] = record.activity_threshold;
    buf[OFF_LRL] = record.lrl;
    buf[OFF_URL] = record.url;
    buf[OFF_MSR] = record.msr;

    buf
}

/// Coerce loosely typed fields and encode them; fails before any I/O.
pub fn encode_fields(mode: &str, fields: &BTreeMap<String, serde_json::Value>) -> Result<[u8; PAYLOAD_LEN]> {
    let mode = PacingMode::from_symbol(mode);
    let record = ParameterRecord::from_fields(mode, fields)?;
    Ok(encode(mode, &record))
}

/// Decode a parameter payload or a full interrogation response.
pub fn decode(data: &[u8]) -> Result<ParameterRecord> {
    if data.len() < PAYLOAD_LEN {
        return Err(SerialError::ShortBuffer {
            expected: PAYLOAD_LEN,
            actual: data.len(),
        });
    }

    Ok(ParameterRecord {
        response_type: data[OFF_RESPONSE_TYPE],
        mode: data[OFF_MODE],
        arp: get_u16(data, OFF_ARP),
        vrp: get_u16(data, OFF_VRP),
        atr_pulse_amp: get_f32(data, OFF_ATR_PULSE_AMP),
        vent_pulse_amp: get_f32(data, OFF_VENT_PULSE_AMP),
        atr_pulse_width: get_u16(data, OFF_ATR_PULSE_WIDTH),
        vent_pulse_width: get_u16(data, OFF_VENT_PULSE_WIDTH),
        atr_cmp_ref_pwm: data[OFF_ATR_CMP_REF_PWM],
        vent_cmp_ref_pwm: data[OFF_VENT_CMP_REF_PWM],
        reaction_time: get_u16(data, OFF_REACTION_TIME),
        recovery_time: get_u16(data, OFF_RECOVERY_TIME),
        fixed_av_delay: data[OFF_FIXED_AV_DELAY],
        response_factor: data[OFF_RESPONSE_FACTOR],
        activity_threshold: data[OFF_ACTIVITY_THRESHOLD],
        lrl: data[OFF_LRL],
        url: data[OFF_URL],
        msr: data[OFF_MSR],
    })
}

/// Ventricular samples come first, then atrial.
pub fn decode_signals(data: &[u8]) -> Result<SignalFrame> {
    if data.len() != RESPONSE_LEN {
        return Err(SerialError::ShortBuffer {
            expected: RESPONSE_LEN,
            actual: data.len(),
        });
    }

    let mut frame = SignalFrame {
        ventricular: [0.0; SIGNAL_SAMPLES],
        atrial: [0.0; SIGNAL_SAMPLES],
    };
    for i in 0..SIGNAL_SAMPLES {
        frame.ventricular[i] = get_f32(data, i * 4);
        frame.atrial[i] = get_f32(data, (SIGNAL_SAMPLES + i) * 4);
    }
    Ok(frame)
}

/// Inverse of `decode_signals`, used by the simulator
pub fn encode_signals(frame: &SignalFrame) -> [u8; RESPONSE_LEN] {
    let mut buf = [0u8; RESPONSE_LEN];
    for i in 0..SIGNAL_SAMPLES {
        put_f32(&mut buf, i * 4, frame.ventricular[i]);
        put_f32(&mut buf, (SIGNAL_SAMPLES + i) * 4, frame.atrial[i]);
    }
    buf
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn get_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
