pub mod serial;
pub mod params;
pub mod device;
pub mod egm;
pub mod commands;
pub mod cli;

pub use device::{AppSettings, DeviceManager};
pub use params::{PacingMode, ParameterRecord};
pub use serial::{PacemakerProtocol, ProtocolVariant, SimulatedPacemaker};
