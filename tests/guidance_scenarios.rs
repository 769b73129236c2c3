mod common;

use common::{reading, RecordingDispatcher};
use std::time::{Duration, Instant};
use sun_guider::{
    ConnectionState, Direction, GuidanceConfig, GuidanceEvent, GuidanceState, GuidanceStateMachine,
    Pulse, SafetyTrip, SetpointState,
};

fn every_position() -> GuidanceConfig {
    GuidanceConfig {
        positions_per_guidance: 1,
        ..GuidanceConfig::default()
    }
}

#[test]
fn large_offset_is_clamped_to_the_maximum_pulse() {
    let mut gsm = GuidanceStateMachine::new(every_position());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.start();
    gsm.observe(reading(600.0, 300.0, 8.0), t0, &mut drive);
    let report = gsm.observe(reading(100.0, 300.0, 8.0), t0 + Duration::from_secs(5), &mut drive);

    assert_eq!(
        report.pulses,
        vec![Pulse {
            direction: Direction::South,
            duration_ms: 10_000
        }]
    );
    assert_eq!(drive.sent(), report.pulses);
    let offset = report.record.offset.unwrap();
    assert_eq!((offset.row, offset.col), (500.0, 0.0));
}

#[test]
fn holding_within_tolerance_never_pulses() {
    let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.start();
    for i in 0..20 {
        let jitter = if i % 2 == 0 { 0.02 } else { -0.02 };
        gsm.observe(reading(50.0 + jitter, 70.0, 5.0), t0 + Duration::from_secs(i * 5), &mut drive);
    }
    assert_eq!(gsm.setpoint_state(), SetpointState::Ok);
    assert!(drive.sent().is_empty());
}

#[test]
fn runaway_trips_and_only_a_reset_recovers() {
    let mut gsm = GuidanceStateMachine::new(every_position());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.start();
    gsm.observe(reading(50.0, 50.0, 5.0), t0, &mut drive);

    // The drive "moves the wrong way": every correction is followed by a larger offset.
    let mut tripped_at = None;
    for i in 1..=10u64 {
        let now = t0 + Duration::from_secs(i * 5);
        gsm.observe(reading(50.0 - 1.5 * i as f64, 50.0, 5.0), now, &mut drive);
        if gsm.guidance_state() == GuidanceState::StoppedDiverge {
            tripped_at = Some(i);
            break;
        }
    }
    // Growth streak of 4 with the offset beyond 5 px: 1.5, 3, 4.5, 6 px.
    assert_eq!(tripped_at, Some(4));
    let trips: Vec<_> = gsm
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            GuidanceEvent::SafetyStop(trip) => Some(trip),
            _ => None,
        })
        .collect();
    assert!(matches!(trips.as_slice(), [SafetyTrip::Divergence { cycles: 4, .. }]));

    let before = drive.sent().len();
    for i in 11..15u64 {
        gsm.observe(reading(30.0, 50.0, 5.0), t0 + Duration::from_secs(i * 5), &mut drive);
    }
    gsm.start();
    gsm.observe(reading(30.0, 50.0, 5.0), t0 + Duration::from_secs(80), &mut drive);
    assert_eq!(drive.sent().len(), before);

    gsm.reset_setpoint().unwrap();
    assert_eq!(gsm.guidance_state(), GuidanceState::Running);
    gsm.observe(reading(31.0, 50.0, 5.0), t0 + Duration::from_secs(85), &mut drive);
    assert_eq!(drive.sent().len(), before + 1);
    assert_eq!(drive.sent()[before].direction, Direction::North);
}

#[test]
fn clouds_shorter_than_the_sustain_are_ridden_out() {
    let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.start();
    gsm.observe(reading(10.0, 10.0, 5.0), t0, &mut drive);

    for s in [5, 30, 60, 115] {
        gsm.observe(reading(10.0, 10.0, 1.2), t0 + Duration::from_secs(s), &mut drive);
        assert_eq!(gsm.guidance_state(), GuidanceState::RunningNoisy);
    }
    gsm.observe(reading(10.0, 10.0, 5.0), t0 + Duration::from_secs(120), &mut drive);
    assert_eq!(gsm.guidance_state(), GuidanceState::Running);

    // A second, longer spell of clouds stops guidance.
    for s in [125, 200, 244] {
        gsm.observe(None, t0 + Duration::from_secs(s), &mut drive);
    }
    assert_eq!(gsm.guidance_state(), GuidanceState::RunningNoisy);
    gsm.observe(None, t0 + Duration::from_secs(245), &mut drive);
    assert_eq!(gsm.guidance_state(), GuidanceState::StoppedNoise);
    assert!(gsm
        .drain_events()
        .iter()
        .any(|e| matches!(e, GuidanceEvent::SafetyStop(SafetyTrip::NoiseTimeout { .. }))));
}

#[test]
fn link_drop_mid_run_pauses_and_resumes() {
    let mut gsm = GuidanceStateMachine::new(every_position());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.on_connection_check(ConnectionState::On);
    gsm.start();
    gsm.observe(reading(20.0, 20.0, 5.0), t0, &mut drive);

    drive.set_link(ConnectionState::Off);
    gsm.observe(reading(22.0, 20.0, 5.0), t0 + Duration::from_secs(5), &mut drive);
    assert_eq!(gsm.connection_state(), ConnectionState::Off);
    assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);

    gsm.on_connection_check(ConnectionState::LinkUnavailable);
    assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);

    drive.set_link(ConnectionState::On);
    gsm.on_connection_check(ConnectionState::On);
    assert_eq!(gsm.guidance_state(), GuidanceState::Running);
    gsm.observe(reading(22.0, 20.0, 5.0), t0 + Duration::from_secs(10), &mut drive);
    assert_eq!(
        drive.sent(),
        vec![Pulse {
            direction: Direction::North,
            duration_ms: 50
        }]
    );
}

#[test]
fn histories_grow_with_every_tick() {
    let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
    let mut drive = RecordingDispatcher::new();
    let t0 = Instant::now();
    gsm.start();
    gsm.observe(reading(1.0, 1.0, 5.0), t0, &mut drive);
    gsm.observe(None, t0 + Duration::from_secs(5), &mut drive);
    gsm.observe(reading(1.5, 1.0, 1.0), t0 + Duration::from_secs(10), &mut drive);
    gsm.observe(reading(1.2, 1.0, 5.0), t0 + Duration::from_secs(15), &mut drive);

    assert_eq!(gsm.positions().len(), 3);
    assert_eq!(gsm.offsets().len(), 2, "only coherent readings produce offsets");
    assert_eq!(gsm.setpoints().len(), 1);
    assert!(gsm.positions().windows(2).all(|w| w[0].at <= w[1].at));
}
