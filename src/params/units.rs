//! Conversions between the programmer's human units and wire encodings.
//!
//! Every function here is total. Out-of-range and NaN inputs are clamped;
//! range checking against clinical limits is done by
//! [`DisplayParameters::validate`] at the caller's discretion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Field, PacingMode, ParameterRecord};

pub const PULSE_WIDTH_MULTIPLIER: f64 = 25.0; // GUI ms * 25 = wire value (0.4 ms -> 10)
pub const SENSITIVITY_PWM_BASE: f64 = 25.0; // PWM value at 0 mV
pub const SENSITIVITY_PWM_SCALE: f64 = 23.0; // PWM increase per mV
pub const SENSITIVITY_MAX_MV: f64 = 10.0;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn clamp_round(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.round().clamp(0.0, max)
}

pub fn pulse_width_ms_to_wire(ms: f64) -> u16 {
    clamp_round(ms * PULSE_WIDTH_MULTIPLIER, u16::MAX as f64) as u16
}

pub fn pulse_width_wire_to_ms(wire: u16) -> f64 {
    round2(wire as f64 / PULSE_WIDTH_MULTIPLIER)
}

pub fn sensitivity_mv_to_pwm(mv: f64) -> u8 {
    clamp_round(SENSITIVITY_PWM_BASE + mv * SENSITIVITY_PWM_SCALE, u8::MAX as f64) as u8
}

pub fn sensitivity_pwm_to_mv(pwm: u8) -> f64 {
    let mv = (pwm as f64 - SENSITIVITY_PWM_BASE) / SENSITIVITY_PWM_SCALE;
    round2(mv.clamp(0.0, SENSITIVITY_MAX_MV))
}

/// Volts travel as f32
pub fn amplitude_to_wire(volts: f64) -> f32 {
    if volts.is_nan() {
        return 0.0;
    }
    volts.clamp(f32::MIN as f64, f32::MAX as f64) as f32
}

pub fn amplitude_from_wire(wire: f32) -> f64 {
    round2(wire as f64)
}

/// Rates, times and counts pass through, clamped to the wire width
pub fn to_wire_u8(value: f64) -> u8 {
    clamp_round(value, u8::MAX as f64) as u8
}

pub fn to_wire_u16(value: f64) -> u16 {
    clamp_round(value, u16::MAX as f64) as u16
}

/// Accelerometer activity threshold for the rate-adaptive modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityThreshold {
    #[serde(rename = "V-Low")]
    VeryLow,
    #[serde(rename = "Low")]
    Low,
    #[serde(rename = "Med-Low")]
    MedLow,
    #[serde(rename = "Med")]
    Med,
    #[serde(rename = "Med-High")]
    MedHigh,
    #[serde(rename = "High")]
    High,
    #[serde(rename = "V-High")]
    VeryHigh,
}

impl ActivityThreshold {
    pub const LEVELS: [ActivityThreshold; 7] = [
        ActivityThreshold::VeryLow,
        ActivityThreshold::Low,
        ActivityThreshold::MedLow,
        ActivityThreshold::Med,
        ActivityThreshold::MedHigh,
        ActivityThreshold::High,
        ActivityThreshold::VeryHigh,
    ];

    /// Float codes used by the firmware revisions that carry the threshold as f32
    pub const FLOAT_CODES: [f32; 7] = [
        1.05,
        1.05 + 0.55 / 6.0,
        1.05 + 2.0 * 0.55 / 6.0,
        1.05 + 3.0 * 0.55 / 6.0,
        1.05 + 4.0 * 0.55 / 6.0,
        1.05 + 5.0 * 0.55 / 6.0,
        1.6,
    ];

    pub fn index(self) -> usize {
        Self::LEVELS.iter().position(|l| *l == self).unwrap_or(0)
    }

    pub fn label(self) -> &'static str {
        match self {
            ActivityThreshold::VeryLow => "V-Low",
            ActivityThreshold::Low => "Low",
            ActivityThreshold::MedLow => "Med-Low",
            ActivityThreshold::Med => "Med",
            ActivityThreshold::MedHigh => "Med-High",
            ActivityThreshold::High => "High",
            ActivityThreshold::VeryHigh => "V-High",
        }
    }

    /// 1-based code carried in the u8 wire field
    pub fn to_wire(self) -> u8 {
        self.index() as u8 + 1
    }

    /// Codes outside 1..=7 snap to the nearest level
    pub fn from_wire(code: u8) -> Self {
        let idx = (code.max(1) as usize - 1).min(Self::LEVELS.len() - 1);
        Self::LEVELS[idx]
    }

    pub fn to_float(self) -> f32 {
        Self::FLOAT_CODES[self.index()]
    }

    /// Closest level by absolute difference; ties go to the lower level.
    pub fn nearest_from_float(value: f32) -> Self {
        Self::LEVELS[nearest_index(value, &Self::FLOAT_CODES)]
    }
}

fn nearest_index(value: f32, codes: &[f32]) -> usize {
    if value.is_nan() {
        return 0;
    }
    let mut best = 0;
    let mut best_diff = f32::INFINITY;
    for (i, code) in codes.iter().enumerate() {
        let diff = (value - code).abs();
        // strict comparison keeps the lower index on ties
        if diff < best_diff {
            best = i;
            best_diff = diff;
        }
    }
    best
}

impl Default for ActivityThreshold {
    fn default() -> Self {
        ActivityThreshold::VeryLow
    }
}

impl fmt::Display for ActivityThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ActivityThreshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::LEVELS
            .iter()
            .copied()
            .find(|l| l.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown activity threshold: {}", s))
    }
}

/// Parameter set in the units an operator enters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayParameters {
    pub lower_rate_limit: f64,        // ppm
    pub upper_rate_limit: f64,        // ppm
    pub maximum_sensor_rate: f64,     // ppm
    pub atrial_amplitude: f64,        // V
    pub ventricular_amplitude: f64,   // V
    pub atrial_pulse_width: f64,      // ms
    pub ventricular_pulse_width: f64, // ms
    pub atrial_sensitivity: f64,      // mV
    pub ventricular_sensitivity: f64, // mV
    pub arp: f64,                     // ms
    pub vrp: f64,                     // ms
    pub fixed_av_delay: f64,          // ms
    pub reaction_time: f64,           // s
    pub recovery_time: f64,           // min
    pub response_factor: f64,
    pub activity_threshold: ActivityThreshold,
}

impl Default for DisplayParameters {
    fn default() -> Self {
        Self {
            lower_rate_limit: 60.0,
            upper_rate_limit: 120.0,
            maximum_sensor_rate: 120.0,
            atrial_amplitude: 3.5,
            ventricular_amplitude: 3.5,
            atrial_pulse_width: 0.4,
            ventricular_pulse_width: 0.4,
            atrial_sensitivity: 2.5,
            ventricular_sensitivity: 2.5,
            arp: 250.0,
            vrp: 320.0,
            fixed_av_delay: 150.0,
            reaction_time: 30.0,
            recovery_time: 5.0,
            response_factor: 8.0,
            activity_threshold: ActivityThreshold::VeryLow,
        }
    }
}

/// A value outside its programmable range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeViolation {
    pub field: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} outside {}..={}", self.field, self.value, self.min, self.max)
    }
}

/// Programmable ranges, keyed by wire field
pub fn programmable_range(field: Field) -> Option<(f64, f64)> {
    match field {
        Field::Lrl => Some((30.0, 175.0)),
        Field::Url => Some((50.0, 175.0)),
        Field::Msr => Some((50.0, 175.0)),
        Field::AtrPulseAmp | Field::VentPulseAmp => Some((0.0, 7.0)),
        Field::AtrPulseWidth | Field::VentPulseWidth => Some((0.05, 1.9)),
        Field::AtrCmpRefPwm | Field::VentCmpRefPwm => Some((0.0, 10.0)),
        Field::Arp | Field::Vrp => Some((150.0, 500.0)),
        Field::ReactionTime => Some((10.0, 50.0)),
        Field::RecoveryTime => Some((2.0, 16.0)),
        Field::ResponseFactor => Some((1.0, 16.0)),
        Field::FixedAvDelay => Some((70.0, 300.0)),
        Field::ResponseType | Field::ActivityThreshold => None,
    }
}

impl DisplayParameters {
    /// Value of a field in display units
    pub fn value(&self, field: Field) -> Option<f64> {
        let v = match field {
            Field::Lrl => self.lower_rate_limit,
            Field::Url => self.upper_rate_limit,
            Field::Msr => self.maximum_sensor_rate,
            Field::AtrPulseAmp => self.atrial_amplitude,
            Field::VentPulseAmp => self.ventricular_amplitude,
            Field::AtrPulseWidth => self.atrial_pulse_width,
            Field::VentPulseWidth => self.ventricular_pulse_width,
            Field::AtrCmpRefPwm => self.atrial_sensitivity,
            Field::VentCmpRefPwm => self.ventricular_sensitivity,
            Field::Arp => self.arp,
            Field::Vrp => self.vrp,
            Field::FixedAvDelay => self.fixed_av_delay,
            Field::ReactionTime => self.reaction_time,
            Field::RecoveryTime => self.recovery_time,
            Field::ResponseFactor => self.response_factor,
            Field::ActivityThreshold => self.activity_threshold.to_wire() as f64,
            Field::ResponseType => return None,
        };
        Some(v)
    }

    /// Check the fields active in `mode` against their programmable ranges.
    pub fn validate(&self, mode: PacingMode) -> Vec<RangeViolation> {
        let mut violations = Vec::new();

        for field in mode.active_fields() {
            let (Some(value), Some((min, max))) = (self.value(field), programmable_range(field)) else {
                continue;
            };
            if value.is_nan() || value < min || value > max {
                violations.push(RangeViolation {
                    field: field.name().to_string(),
                    value,
                    min,
                    max,
                });
            }
        }

        if self.upper_rate_limit < self.lower_rate_limit {
            violations.push(RangeViolation {
                field: Field::Url.name().to_string(),
                value: self.upper_rate_limit,
                min: self.lower_rate_limit,
                max: 175.0,
            });
        }

        violations
    }

    pub fn to_record(&self, mode: PacingMode, response_type: u8) -> ParameterRecord {
        ParameterRecord {
            response_type,
            mode: mode.code(),
            arp: to_wire_u16(self.arp),
            vrp: to_wire_u16(self.vrp),
            atr_pulse_amp: amplitude_to_wire(self.atrial_amplitude),
            vent_pulse_amp: amplitude_to_wire(self.ventricular_amplitude),
            atr_pulse_width: pulse_width_ms_to_wire(self.atrial_pulse_width),
            vent_pulse_width: pulse_width_ms_to_wire(self.ventricular_pulse_width),
            atr_cmp_ref_pwm: sensitivity_mv_to_pwm(self.atrial_sensitivity),
            vent_cmp_ref_pwm: sensitivity_mv_to_pwm(self.ventricular_sensitivity),
            reaction_time: to_wire_u16(self.reaction_time),
            recovery_time: to_wire_u16(self.recovery_time),
            fixed_av_delay: to_wire_u8(self.fixed_av_delay),
            response_factor: to_wire_u8(self.response_factor),
            activity_threshold: self.activity_threshold.to_wire(),
            lrl: to_wire_u8(self.lower_rate_limit),
            url: to_wire_u8(self.upper_rate_limit),
            msr: to_wire_u8(self.maximum_sensor_rate),
        }
    }

    pub fn from_record(record: &ParameterRecord) -> Self {
        Self {
            lower_rate_limit: record.lrl as f64,
            upper_rate_limit: record.url as f64,
            maximum_sensor_rate: record.msr as f64,
            atrial_amplitude: amplitude_from_wire(record.atr_pulse_amp),
            ventricular_amplitude: amplitude_from_wire(record.vent_pulse_amp),
            atrial_pulse_width: pulse_width_wire_to_ms(record.atr_pulse_width),
            ventricular_pulse_width: pulse_width_wire_to_ms(record.vent_pulse_width),
            atrial_sensitivity: sensitivity_pwm_to_mv(record.atr_cmp_ref_pwm),
            ventricular_sensitivity: sensitivity_pwm_to_mv(record.vent_cmp_ref_pwm),
            arp: record.arp as f64,
            vrp: record.vrp as f64,
            fixed_av_delay: record.fixed_av_delay as f64,
            reaction_time: record.reaction_time as f64,
            recovery_time: record.recovery_time as f64,
            response_factor: record.response_factor as f64,
            activity_threshold: ActivityThreshold::from_wire(record.activity_threshold),
        }
    }
}
