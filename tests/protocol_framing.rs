use std::collections::BTreeMap;
use std::time::Duration;

use pacemaker_dcm_lib::params::binary::SIGNAL_SAMPLES;
use pacemaker_dcm_lib::params::{PacingMode, ParameterRecord, RESPONSE_TYPE_PARAMETERS, RESPONSE_TYPE_SIGNALS};
use pacemaker_dcm_lib::serial::protocol::{CMD_ECHO, CMD_GET_EGM, CMD_GET_PARAMS, CMD_SET_PARAMS, SYNC};
use pacemaker_dcm_lib::serial::simulator::Fault;
use pacemaker_dcm_lib::serial::{
    EngineState, PacemakerProtocol, ProtocolConfig, ProtocolTiming, ProtocolVariant, SerialError,
    SimulatedPacemaker,
};

fn config(variant: ProtocolVariant) -> ProtocolConfig {
    ProtocolConfig {
        variant,
        read_timeout: Duration::from_millis(20),
        timing: ProtocolTiming::immediate(),
    }
}

async fn connect(sim: &SimulatedPacemaker, variant: ProtocolVariant) -> PacemakerProtocol {
    PacemakerProtocol::establish(Box::new(sim.clone()), config(variant))
        .await
        .expect("simulator handshake")
}

#[tokio::test]
async fn test_optimistic_interrogate_request_shape() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    let record = protocol.interrogate_device().await.unwrap();
    assert_eq!(record, ParameterRecord::default());
    assert_eq!(protocol.state(), EngineState::Connected);

    let frames = sim.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 34);
    assert_eq!(&frames[0][..2], &[SYNC, CMD_ECHO]);
    assert!(frames[0][2..].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_acknowledged_request_shapes() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
    let mut protocol = connect(&sim, ProtocolVariant::Acknowledged).await;

    protocol
        .program_parameters(PacingMode::Aoor, &ParameterRecord::default())
        .await
        .unwrap();
    protocol.interrogate_device().await.unwrap();
    protocol.get_signals().await.unwrap();

    let frames = sim.sent_frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(&frames[1][..2], &[SYNC, CMD_SET_PARAMS]);
    assert_eq!(frames[2], vec![SYNC, CMD_GET_PARAMS]);
    assert_eq!(frames[3], vec![SYNC, CMD_GET_EGM]);
}

#[tokio::test]
async fn test_short_read_is_incomplete_data() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    sim.inject(Fault::Truncate(40));
    let err = protocol.interrogate_device().await.unwrap_err();
    assert!(matches!(err, SerialError::IncompleteData { expected: 88, actual: 40 }), "{:?}", err);

    // The link survives a short read
    assert!(protocol.is_connected());
    assert!(protocol.interrogate_device().await.is_ok());
}

#[tokio::test]
async fn test_short_prefixed_read_counts_prefix() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
    let mut protocol = connect(&sim, ProtocolVariant::Acknowledged).await;

    sim.inject(Fault::Truncate(50));
    let err = protocol.interrogate_device().await.unwrap_err();
    assert!(matches!(err, SerialError::IncompleteData { expected: 90, actual: 50 }), "{:?}", err);
}

#[tokio::test]
async fn test_wrong_sync_byte_is_rejected() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
    let mut protocol = connect(&sim, ProtocolVariant::Acknowledged).await;

    sim.inject(Fault::BadSync);
    let err = protocol.interrogate_device().await.unwrap_err();
    assert!(matches!(err, SerialError::ProtocolMismatch(_)), "{:?}", err);
    assert!(!err.is_fatal());

    // Stale bytes are cleared before the next request
    assert!(protocol.interrogate_device().await.is_ok());
}

#[tokio::test]
async fn test_acknowledged_program_failures() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
    let mut protocol = connect(&sim, ProtocolVariant::Acknowledged).await;
    let record = ParameterRecord::default();

    sim.inject(Fault::Nack);
    let err = protocol.program_parameters(PacingMode::Vvi, &record).await.unwrap_err();
    assert!(matches!(err, SerialError::Nack));

    sim.inject(Fault::Truncate(1));
    let err = protocol.program_parameters(PacingMode::Vvi, &record).await.unwrap_err();
    assert!(matches!(err, SerialError::IncompleteData { expected: 2, actual: 1 }));

    sim.inject(Fault::BadSync);
    let err = protocol.program_parameters(PacingMode::Vvi, &record).await.unwrap_err();
    assert!(matches!(err, SerialError::ProtocolMismatch(_)));

    protocol.program_parameters(PacingMode::Vvi, &record).await.unwrap();
}

#[tokio::test]
async fn test_optimistic_program_never_reads() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    // A silent device is indistinguishable from a healthy one here
    sim.inject(Fault::Silent);
    let record = ParameterRecord {
        lrl: 80,
        ..ParameterRecord::default()
    };
    protocol.program_parameters(PacingMode::Voor, &record).await.unwrap();
    assert_eq!(sim.stored_parameters().lrl, 80);
    assert_eq!(sim.stored_parameters().pacing_mode(), PacingMode::Voor);
}

#[tokio::test]
async fn test_program_fields_coerces_loose_values() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    let fields: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(r#"{"mode": "ignored", "LRL": "65", "ATR_PULSE_AMP": 4, "arp": 300.0}"#).unwrap();
    let record = protocol.program_fields("AAI", &fields).await.unwrap();
    assert_eq!(record.lrl, 65);
    assert_eq!(record.arp, 300);
    assert_eq!(record.atr_pulse_amp, 4.0);
    assert_eq!(sim.stored_parameters(), record);
}

#[tokio::test]
async fn test_signal_frames_in_both_variants() {
    let streaming = ParameterRecord {
        response_type: RESPONSE_TYPE_SIGNALS,
        ..ParameterRecord::default()
    };
    for variant in [ProtocolVariant::Optimistic, ProtocolVariant::Acknowledged] {
        let sim = SimulatedPacemaker::new(variant).with_parameters(streaming);
        let mut protocol = connect(&sim, variant).await;

        let first = protocol.get_signals().await.unwrap();
        let second = protocol.get_signals().await.unwrap();
        assert_eq!(first.ventricular.len(), SIGNAL_SAMPLES);
        assert_eq!(first.atrial.len(), SIGNAL_SAMPLES);
        assert_ne!(first, second);
        assert_eq!(protocol.state(), EngineState::Connected);
    }
}

#[tokio::test]
async fn test_optimistic_signals_switch_device_to_streaming() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    let frame = protocol.get_signals().await.unwrap();
    assert_eq!(frame.ventricular[0], 0.0);
    assert_eq!(frame.ventricular[1], (0.25f32).sin() * 2.0);
    assert_eq!(protocol.response_type(), Some(RESPONSE_TYPE_SIGNALS));
    assert_eq!(sim.stored_parameters().response_type, RESPONSE_TYPE_SIGNALS);

    // echo readback, reprogram with response type 0, then the signal request
    let frames = sim.sent_frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(&frames[0][..2], &[SYNC, CMD_ECHO]);
    assert_eq!(&frames[1][..2], &[SYNC, CMD_SET_PARAMS]);
    assert_eq!(frames[1][2], RESPONSE_TYPE_SIGNALS);
    assert_eq!(&frames[2][..2], &[SYNC, CMD_ECHO]);

    protocol.get_signals().await.unwrap();
    assert_eq!(sim.sent_frames().len(), 4);
}

#[tokio::test]
async fn test_optimistic_interrogate_refused_while_streaming() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    let streaming = ParameterRecord {
        response_type: RESPONSE_TYPE_SIGNALS,
        ..ParameterRecord::default()
    };
    protocol.program_parameters(PacingMode::Vvi, &streaming).await.unwrap();
    let sent = sim.sent_frames().len();

    let err = protocol.interrogate_device().await.unwrap_err();
    assert!(
        matches!(err, SerialError::ResponseMode { expected: RESPONSE_TYPE_PARAMETERS, actual: RESPONSE_TYPE_SIGNALS }),
        "{:?}",
        err
    );
    assert_eq!(sim.sent_frames().len(), sent);
    assert!(protocol.is_connected());

    // Programming parameter echo mode makes readback possible again
    protocol
        .program_parameters(PacingMode::Vvi, &ParameterRecord::default())
        .await
        .unwrap();
    let record = protocol.interrogate_device().await.unwrap();
    assert_eq!(record.pacing_mode(), PacingMode::Vvi);
}

#[tokio::test]
async fn test_optimistic_interrogate_rejects_signal_reply() {
    let streaming = ParameterRecord {
        response_type: RESPONSE_TYPE_SIGNALS,
        ..ParameterRecord::default()
    };
    let sim = SimulatedPacemaker::new(ProtocolVariant::Optimistic).with_parameters(streaming);
    let mut protocol = connect(&sim, ProtocolVariant::Optimistic).await;

    let err = protocol.interrogate_device().await.unwrap_err();
    assert!(matches!(err, SerialError::ProtocolMismatch(_)), "{:?}", err);
    assert!(!err.is_fatal());
    assert!(protocol.is_connected());
}

#[tokio::test]
async fn test_program_after_misaligned_readback() {
    let sim = SimulatedPacemaker::new(ProtocolVariant::Acknowledged);
    let mut protocol = connect(&sim, ProtocolVariant::Acknowledged).await;

    sim.inject(Fault::BadSync);
    assert!(protocol.interrogate_device().await.is_err());

    let record = ParameterRecord {
        lrl: 72,
        ..ParameterRecord::default()
    };
    protocol.program_parameters(PacingMode::Aai, &record).await.unwrap();
    assert_eq!(sim.stored_parameters().lrl, 72);

    sim.inject(Fault::BadSync);
    assert!(protocol.interrogate_device().await.is_err());
    let result = protocol.echo_test_parameters(PacingMode::Aai, &record).await;
    assert!(result.passed, "{}", result.message);
}
