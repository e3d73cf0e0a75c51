mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{connect, fast_config};
use trionic_flash::{
    firmware::EcuVariant,
    hardware::simulation::{ReplyScript, SimulatedEcu},
    segmented::FlowState,
    session::SessionManager,
    DiagError,
};

const CLEAR_TO_SEND: [u8; 8] = [0x30, 0x00, 0x00, 0, 0, 0, 0, 0];
const WAIT: [u8; 8] = [0x31, 0x00, 0x00, 0, 0, 0, 0, 0];
const OVERFLOW: [u8; 8] = [0x32, 0x00, 0x00, 0, 0, 0, 0, 0];

fn ecu_with_short_did() -> Arc<SimulatedEcu> {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    ecu.set_did(0x90, b"T8");
    ecu
}

/// Writes a record long enough to need consecutive frames
fn write_long(session: &mut SessionManager) -> Result<(), DiagError> {
    let long: Vec<u8> = (0..40u8).collect();
    session.client().kwp_write_local_identifier(0x92, &long)
}

fn consecutive_frames_sent(ecu: &SimulatedEcu) -> usize {
    ecu.frames().iter().filter(|f| f.data()[0] >> 4 == 0x2).count()
}

fn reads_sent(ecu: &SimulatedEcu) -> usize {
    ecu.requests()
        .iter()
        .filter(|r| r.as_slice() == [0x1A, 0x90])
        .count()
}

#[test]
fn block_size_above_one_is_rejected() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[[0x30, 0x02, 0x00, 0, 0, 0, 0, 0]]);
    let mut session = connect(&ecu, &fast_config());
    assert!(matches!(
        write_long(&mut session),
        Err(DiagError::FlowControlRejected)
    ));
    assert_eq!(session.client().codec().flow_state(), FlowState::Aborted);
    assert_eq!(consecutive_frames_sent(&ecu), 0);
}

#[test]
fn overflow_is_rejected() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[OVERFLOW]);
    let mut session = connect(&ecu, &fast_config());
    assert!(matches!(
        write_long(&mut session),
        Err(DiagError::FlowControlRejected)
    ));
    assert_eq!(consecutive_frames_sent(&ecu), 0);
}

#[test]
fn wait_flow_control_is_honoured() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[WAIT, WAIT, CLEAR_TO_SEND]);
    let mut session = connect(&ecu, &fast_config());
    write_long(&mut session).unwrap();
    assert_eq!(session.client().codec().flow_state(), FlowState::Complete);
    assert_eq!(ecu.did(0x92).unwrap(), (0..40u8).collect::<Vec<u8>>());
}

#[test]
fn endless_wait_flow_control_times_out() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[WAIT; 9]);
    let mut session = connect(&ecu, &fast_config());
    assert!(matches!(write_long(&mut session), Err(DiagError::Timeout)));
    assert_eq!(consecutive_frames_sent(&ecu), 0);
}

#[test]
fn response_pending_before_flow_control_keeps_waiting() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[[0x03, 0x7F, 0x3B, 0x78, 0, 0, 0, 0], CLEAR_TO_SEND]);
    let mut session = connect(&ecu, &fast_config());
    write_long(&mut session).unwrap();
    assert_eq!(ecu.did(0x92).unwrap().len(), 40);
}

#[test]
fn refusal_before_flow_control_ends_transfer() {
    let ecu = ecu_with_short_did();
    ecu.script_flow_control(&[[0x03, 0x7F, 0x3B, 0x22, 0, 0, 0, 0]]);
    let mut session = connect(&ecu, &fast_config());
    let err = write_long(&mut session).unwrap_err();
    assert_eq!(err.nrc(), Some(0x22));
    assert_eq!(consecutive_frames_sent(&ecu), 0);
}

#[test]
fn pending_replies_within_budget() {
    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        pending: 8,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    assert_eq!(session.client().kwp_read_ecu_identification(0x90).unwrap(), b"T8");
    assert_eq!(reads_sent(&ecu), 1);
}

#[test]
fn pending_replies_beyond_budget() {
    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        pending: 9,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    let err = session.client().kwp_read_ecu_identification(0x90).unwrap_err();
    assert_eq!(err.nrc(), Some(0x78));
}

#[test]
fn pending_reply_extends_the_read_timeout() {
    let cfg = {
        let mut c = fast_config();
        c.read_timeout_ms = 100;
        c
    };

    // Answer arrives 150 ms after the request: too late for 100 ms, fine for 200 ms
    let answer_late = |pending: u32| {
        let ecu = ecu_with_short_did();
        ecu.script_replies(ReplyScript {
            sid: 0x1A,
            pending,
            withhold_answer: true,
            ..Default::default()
        });
        let mut session = connect(&ecu, &cfg);
        let late = ecu.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            late.inject_response(&[0x5A, 0x90, b'T', b'8']).unwrap();
        });
        let res = session.client().kwp_read_ecu_identification(0x90);
        t.join().unwrap();
        res
    };

    assert_eq!(answer_late(1).unwrap(), b"T8");
    assert!(matches!(answer_late(0), Err(DiagError::Timeout)));
}

#[test]
fn busy_replies_within_budget() {
    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        busy: 5,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    assert_eq!(session.client().kwp_read_ecu_identification(0x90).unwrap(), b"T8");
    assert_eq!(reads_sent(&ecu), 6);
}

#[test]
fn busy_replies_beyond_budget() {
    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        busy: 6,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    let err = session.client().kwp_read_ecu_identification(0x90).unwrap_err();
    assert_eq!(err.nrc(), Some(0x21));
    assert_eq!(reads_sent(&ecu), 6);
}

#[test]
fn unrelated_replies_are_bounded() {
    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        unrelated: 16,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    assert_eq!(session.client().kwp_read_ecu_identification(0x90).unwrap(), b"T8");

    let ecu = ecu_with_short_did();
    ecu.script_replies(ReplyScript {
        sid: 0x1A,
        unrelated: 17,
        ..Default::default()
    });
    let mut session = connect(&ecu, &fast_config());
    assert!(matches!(
        session.client().kwp_read_ecu_identification(0x90),
        Err(DiagError::WrongMessage)
    ));
}
