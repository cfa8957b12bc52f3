pub mod binary;
pub mod units;

pub use binary::{decode, decode_signals, encode, encode_fields, SignalFrame};
pub use units::{ActivityThreshold, DisplayParameters, RangeViolation};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::serial::{Result, SerialError};

/// Pacing mode symbols and their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacingMode {
    #[serde(rename = "AOO")]
    Aoo,
    #[serde(rename = "VOO")]
    Voo,
    #[serde(rename = "AAI")]
    Aai,
    #[serde(rename = "VVI")]
    Vvi,
    #[serde(rename = "AOOR")]
    Aoor,
    #[serde(rename = "VOOR")]
    Voor,
    #[serde(rename = "AAIR")]
    Aair,
    #[serde(rename = "VVIR")]
    Vvir,
    #[serde(rename = "unknown")]
    Unknown,
}

impl PacingMode {
    pub const ALL: [PacingMode; 8] = [
        PacingMode::Aoo,
        PacingMode::Voo,
        PacingMode::Aai,
        PacingMode::Vvi,
        PacingMode::Aoor,
        PacingMode::Voor,
        PacingMode::Aair,
        PacingMode::Vvir,
    ];

    pub fn code(self) -> u8 {
        match self {
            PacingMode::Aoo => 1,
            PacingMode::Voo => 2,
            PacingMode::Aai => 3,
            PacingMode::Vvi => 4,
            PacingMode::Aoor => 5,
            PacingMode::Voor => 6,
            PacingMode::Aair => 7,
            PacingMode::Vvir => 8,
            PacingMode::Unknown => 0,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PacingMode::Aoo,
            2 => PacingMode::Voo,
            3 => PacingMode::Aai,
            4 => PacingMode::Vvi,
            5 => PacingMode::Aoor,
            6 => PacingMode::Voor,
            7 => PacingMode::Aair,
            8 => PacingMode::Vvir,
            _ => PacingMode::Unknown,
        }
    }

    /// Unrecognised symbols map to `Unknown` (code 0)
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol.trim().to_ascii_uppercase().as_str() {
            "AOO" => PacingMode::Aoo,
            "VOO" => PacingMode::Voo,
            "AAI" => PacingMode::Aai,
            "VVI" => PacingMode::Vvi,
            "AOOR" => PacingMode::Aoor,
            "VOOR" => PacingMode::Voor,
            "AAIR" => PacingMode::Aair,
            "VVIR" => PacingMode::Vvir,
            _ => PacingMode::Unknown,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            PacingMode::Aoo => "AOO",
            PacingMode::Voo => "VOO",
            PacingMode::Aai => "AAI",
            PacingMode::Vvi => "VVI",
            PacingMode::Aoor => "AOOR",
            PacingMode::Voor => "VOOR",
            PacingMode::Aair => "AAIR",
            PacingMode::Vvir => "VVIR",
            PacingMode::Unknown => "unknown",
        }
    }

    pub fn is_rate_adaptive(self) -> bool {
        matches!(
            self,
            PacingMode::Aoor | PacingMode::Voor | PacingMode::Aair | PacingMode::Vvir
        )
    }

    /// Fields that are clinically meaningful in this mode
    pub fn active_fields(self) -> Vec<Field> {
        use Field::*;

        let chamber: &[Field] = match self {
            PacingMode::Aoo | PacingMode::Aoor => &[AtrPulseAmp, AtrPulseWidth],
            PacingMode::Voo | PacingMode::Voor => &[VentPulseAmp, VentPulseWidth],
            PacingMode::Aai | PacingMode::Aair => &[AtrPulseAmp, AtrPulseWidth, AtrCmpRefPwm, Arp],
            PacingMode::Vvi | PacingMode::Vvir => &[VentPulseAmp, VentPulseWidth, VentCmpRefPwm, Vrp],
            PacingMode::Unknown => return Field::ALL.to_vec(),
        };

        let mut fields = vec![Lrl, Url];
        fields.extend_from_slice(chamber);
        if self.is_rate_adaptive() {
            fields.extend_from_slice(&[Msr, ActivityThreshold, ReactionTime, ResponseFactor, RecoveryTime]);
        }
        fields
    }
}

impl fmt::Display for PacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match PacingMode::from_symbol(s) {
            PacingMode::Unknown => Err(format!("Unknown pacing mode: {}", s)),
            mode => Ok(mode),
        }
    }
}

/// Programmable fields, named as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    ResponseType,
    Arp,
    Vrp,
    AtrPulseAmp,
    VentPulseAmp,
    AtrPulseWidth,
    VentPulseWidth,
    AtrCmpRefPwm,
    VentCmpRefPwm,
    ReactionTime,
    RecoveryTime,
    FixedAvDelay,
    ResponseFactor,
    ActivityThreshold,
    Lrl,
    Url,
    Msr,
}

impl Field {
    pub const ALL: [Field; 17] = [
        Field::ResponseType,
        Field::Arp,
        Field::Vrp,
        Field::AtrPulseAmp,
        Field::VentPulseAmp,
        Field::AtrPulseWidth,
        Field::VentPulseWidth,
        Field::AtrCmpRefPwm,
        Field::VentCmpRefPwm,
        Field::ReactionTime,
        Field::RecoveryTime,
        Field::FixedAvDelay,
        Field::ResponseFactor,
        Field::ActivityThreshold,
        Field::Lrl,
        Field::Url,
        Field::Msr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::ResponseType => "response_type",
            Field::Arp => "ARP",
            Field::Vrp => "VRP",
            Field::AtrPulseAmp => "ATR_PULSE_AMP",
            Field::VentPulseAmp => "VENT_PULSE_AMP",
            Field::AtrPulseWidth => "ATR_PULSE_WIDTH",
            Field::VentPulseWidth => "VENT_PULSE_WIDTH",
            Field::AtrCmpRefPwm => "ATR_CMP_REF_PWM",
            Field::VentCmpRefPwm => "VENT_CMP_REF_PWM",
            Field::ReactionTime => "REACTION_TIME",
            Field::RecoveryTime => "RECOVERY_TIME",
            Field::FixedAvDelay => "FIXED_AV_DELAY",
            Field::ResponseFactor => "RESPONSE_FACTOR",
            Field::ActivityThreshold => "ACTIVITY_THRESHOLD",
            Field::Lrl => "LRL",
            Field::Url => "URL",
            Field::Msr => "MSR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Field::ALL.iter().copied().find(|f| f.name().eq_ignore_ascii_case(name))
    }

    pub fn is_float(self) -> bool {
        matches!(self, Field::AtrPulseAmp | Field::VentPulseAmp)
    }
}

/// Full parameter set exchanged with the device, in wire units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ParameterRecord {
    #[serde(rename = "response_type")]
    pub response_type: u8,
    #[serde(rename = "mode")]
    pub mode: u8,
    pub arp: u16,
    pub vrp: u16,
    pub atr_pulse_amp: f32,
    pub vent_pulse_amp: f32,
    pub atr_pulse_width: u16,
    pub vent_pulse_width: u16,
    pub atr_cmp_ref_pwm: u8,
    pub vent_cmp_ref_pwm: u8,
    pub reaction_time: u16,
    pub recovery_time: u16,
    pub fixed_av_delay: u8,
    pub response_factor: u8,
    pub activity_threshold: u8,
    pub lrl: u8,
    pub url: u8,
    pub msr: u8,
}

pub const RESPONSE_TYPE_SIGNALS: u8 = 0;
pub const RESPONSE_TYPE_PARAMETERS: u8 = 1;

impl Default for ParameterRecord {
    fn default() -> Self {
        Self {
            response_type: RESPONSE_TYPE_PARAMETERS,
            mode: PacingMode::Unknown.code(),
            arp: 250,
            vrp: 320,
            atr_pulse_amp: 3.5,
            vent_pulse_amp: 3.5,
            atr_pulse_width: 10,  // 0.4 ms
            vent_pulse_width: 10, // 0.4 ms
            atr_cmp_ref_pwm: 82,  // ~2.5 mV
            vent_cmp_ref_pwm: 82,
            reaction_time: 30,
            recovery_time: 5,
            fixed_av_delay: 150,
            response_factor: 8,
            activity_threshold: 1,
            lrl: 60,
            url: 120,
            msr: 120,
        }
    }
}

impl ParameterRecord {
    pub fn pacing_mode(&self) -> PacingMode {
        PacingMode::from_code(self.mode)
    }

    pub fn with_mode(mut self, mode: PacingMode) -> Self {
        self.mode = mode.code();
        self
    }

    /// Numeric value of a field, widened for comparison
    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::ResponseType => self.response_type as f64,
            Field::Arp => self.arp as f64,
            Field::Vrp => self.vrp as f64,
            Field::AtrPulseAmp => self.atr_pulse_amp as f64,
            Field::VentPulseAmp => self.vent_pulse_amp as f64,
            Field::AtrPulseWidth => self.atr_pulse_width as f64,
            Field::VentPulseWidth => self.vent_pulse_width as f64,
            Field::AtrCmpRefPwm => self.atr_cmp_ref_pwm as f64,
            Field::VentCmpRefPwm => self.vent_cmp_ref_pwm as f64,
            Field::ReactionTime => self.reaction_time as f64,
            Field::RecoveryTime => self.recovery_time as f64,
            Field::FixedAvDelay => self.fixed_av_delay as f64,
            Field::ResponseFactor => self.response_factor as f64,
            Field::ActivityThreshold => self.activity_threshold as f64,
            Field::Lrl => self.lrl as f64,
            Field::Url => self.url as f64,
            Field::Msr => self.msr as f64,
        }
    }

    /// Coerce a loosely typed value into the field's wire width.
    pub fn set(&mut self, field: Field, value: &serde_json::Value) -> Result<()> {
        let number = numeric(field, value)?;
        match field {
            Field::AtrPulseAmp => self.atr_pulse_amp = to_f32(field, number)?,
            Field::VentPulseAmp => self.vent_pulse_amp = to_f32(field, number)?,
            Field::Arp => self.arp = to_int(field, number, u16::MAX as f64)? as u16,
            Field::Vrp => self.vrp = to_int(field, number, u16::MAX as f64)? as u16,
            Field::AtrPulseWidth => self.atr_pulse_width = to_int(field, number, u16::MAX as f64)? as u16,
            Field::VentPulseWidth => self.vent_pulse_width = to_int(field, number, u16::MAX as f64)? as u16,
            Field::ReactionTime => self.reaction_time = to_int(field, number, u16::MAX as f64)? as u16,
            Field::RecoveryTime => self.recovery_time = to_int(field, number, u16::MAX as f64)? as u16,
            Field::ResponseType => {
                let v = to_int(field, number, 1.0)? as u8;
                self.response_type = v;
            }
            Field::AtrCmpRefPwm => self.atr_cmp_ref_pwm = to_int(field, number, u8::MAX as f64)? as u8,
            Field::VentCmpRefPwm => self.vent_cmp_ref_pwm = to_int(field, number, u8::MAX as f64)? as u8,
            Field::FixedAvDelay => self.fixed_av_delay = to_int(field, number, u8::MAX as f64)? as u8,
            Field::ResponseFactor => self.response_factor = to_int(field, number, u8::MAX as f64)? as u8,
            Field::ActivityThreshold => self.activity_threshold = to_int(field, number, u8::MAX as f64)? as u8,
            Field::Lrl => self.lrl = to_int(field, number, u8::MAX as f64)? as u8,
            Field::Url => self.url = to_int(field, number, u8::MAX as f64)? as u8,
            Field::Msr => self.msr = to_int(field, number, u8::MAX as f64)? as u8,
        }
        Ok(())
    }

    /// Build a record from a name → value map. Absent fields keep their defaults.
    pub fn from_fields(mode: PacingMode, fields: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let mut record = ParameterRecord::default().with_mode(mode);
        for (name, value) in fields {
            if name.eq_ignore_ascii_case("mode") {
                continue;
            }
            let field = Field::from_name(name)
                .ok_or_else(|| SerialError::invalid_field(name, "unknown field"))?;
            record.set(field, value)?;
        }
        Ok(record)
    }
}

fn numeric(field: Field, value: &serde_json::Value) -> Result<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    number.ok_or_else(|| SerialError::invalid_field(field.name(), format!("not numeric: {}", value)))
}

fn to_f32(field: Field, value: f64) -> Result<f32> {
    if !value.is_finite() || value.abs() > f32::MAX as f64 {
        return Err(SerialError::invalid_field(field.name(), format!("{} is not a representable float", value)));
    }
    Ok(value as f32)
}

fn to_int(field: Field, value: f64, max: f64) -> Result<u32> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(SerialError::invalid_field(field.name(), format!("{} is not an integer", value)));
    }
    if value < 0.0 || value > max {
        return Err(SerialError::invalid_field(field.name(), format!("{} out of range 0..={}", value, max)));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_mode_code_bijection() {
        for code in 1..=8u8 {
            assert_eq!(PacingMode::from_code(code).code(), code);
        }
        for mode in PacingMode::ALL {
            assert_eq!(PacingMode::from_symbol(mode.symbol()), mode);
        }
        assert_eq!(PacingMode::from_symbol("DDDR").code(), 0);
        assert_eq!(PacingMode::from_code(0), PacingMode::Unknown);
        assert_eq!(PacingMode::from_code(9), PacingMode::Unknown);
        assert_eq!(PacingMode::from_code(0).symbol(), "unknown");
    }

    #[test]
    fn test_active_fields_per_mode() {
        let vvi = PacingMode::Vvi.active_fields();
        assert!(vvi.contains(&Field::Vrp));
        assert!(vvi.contains(&Field::VentCmpRefPwm));
        assert!(!vvi.contains(&Field::Arp));
        assert!(!vvi.contains(&Field::Msr));

        let aair = PacingMode::Aair.active_fields();
        assert!(aair.contains(&Field::Arp));
        assert!(aair.contains(&Field::ActivityThreshold));
        assert!(aair.contains(&Field::RecoveryTime));

        assert_eq!(PacingMode::Unknown.active_fields().len(), Field::ALL.len());
    }

    #[test]
    fn test_from_fields_fills_defaults() {
        let record = ParameterRecord::from_fields(
            PacingMode::Vvi,
            &fields(json!({"LRL": 70, "VENT_PULSE_AMP": 4.5, "VRP": "300"})),
        )
        .unwrap();
        assert_eq!(record.mode, 4);
        assert_eq!(record.lrl, 70);
        assert_eq!(record.vrp, 300);
        assert_eq!(record.vent_pulse_amp, 4.5);
        assert_eq!(record.arp, 250);
        assert_eq!(record.msr, 120);
    }

    #[test]
    fn test_from_fields_rejects_bad_values() {
        let err = ParameterRecord::from_fields(PacingMode::Aoo, &fields(json!({"LRL": 300}))).unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { ref field, .. } if field == "LRL"));

        let err = ParameterRecord::from_fields(PacingMode::Aoo, &fields(json!({"ARP": -1}))).unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { .. }));

        let err = ParameterRecord::from_fields(PacingMode::Aoo, &fields(json!({"URL": 12.5}))).unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { .. }));

        let err = ParameterRecord::from_fields(PacingMode::Aoo, &fields(json!({"ATR_PULSE_AMP": "high"}))).unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { ref field, .. } if field == "ATR_PULSE_AMP"));

        let err = ParameterRecord::from_fields(PacingMode::Aoo, &fields(json!({"PVARP": 250}))).unwrap_err();
        assert!(matches!(err, SerialError::InvalidField { ref field, .. } if field == "PVARP"));
    }

    #[test]
    fn test_record_serializes_wire_names() {
        let value = serde_json::to_value(ParameterRecord::default()).unwrap();
        assert_eq!(value["ARP"], json!(250));
        assert_eq!(value["VENT_CMP_REF_PWM"], json!(82));
        assert_eq!(value["response_type"], json!(1));
        assert_eq!(value["mode"], json!(0));
    }
}
