mod common;

use chrono::Duration as ChronoDuration;
use common::{
    fix, heart_rate, t0, test_config, wait_for, wait_until, ChannelLocationSource, Harness,
    ScriptedHealth,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ruck_session_engine::{
    EngineMessage, HeartRateSourceKind, SessionState, SessionStore, StartError,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn three_fixes_ten_metres_apart_cover_twenty_metres() {
    let (source, gps, _modes) = ChannelLocationSource::new();
    let harness = Harness::with(test_config(), |c| c.with_location(Box::new(source)));

    let session_id = harness.start();
    for (secs, north_m) in [(0, 0.0), (15, 10.0), (30, 20.0)] {
        gps.send(fix(secs, north_m)).unwrap();
    }

    let status = wait_for(&harness.engine, WAIT, |s| s.distance_km > 0.019);
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.session_id, Some(session_id));
    assert!(
        (status.distance_km - 0.02).abs() < 0.0005,
        "distance was {}",
        status.distance_km
    );
}

#[test]
fn start_rejected_while_a_session_is_running() {
    let harness = Harness::new(test_config());
    harness.start();

    let err = harness
        .engine
        .request_start(10.0, 70.0, None)
        .expect_err("second start");
    assert_eq!(err, StartError::AlreadyActive);
    assert_eq!(harness.backend.create_calls(), 1);
}

#[test]
fn invalid_weights_never_reach_the_backend() {
    let harness = Harness::new(test_config());
    let err = harness
        .engine
        .request_start(250.0, 80.0, None)
        .expect_err("ruck too heavy");
    assert!(matches!(err, StartError::Validation(_)));
    assert_eq!(harness.backend.create_calls(), 0);
    assert_eq!(harness.engine.sync().state, SessionState::Idle);
}

#[test]
fn backend_rejection_returns_engine_to_idle() {
    let harness = Harness::new(test_config());
    harness.backend.fail_create_with(StartError::Unauthorized);

    let err = harness
        .engine
        .request_start(20.0, 80.0, None)
        .expect_err("unauthorized");
    assert_eq!(err, StartError::Unauthorized);

    let status = harness.engine.sync();
    assert_eq!(status.state, SessionState::Idle);
    assert!(status.session_id.is_none());
    assert!(status.last_error.is_some());
}

#[test]
fn pause_for_five_seconds_is_excluded_from_elapsed() {
    let harness = Harness::new(test_config());
    harness.start();

    harness.advance(10);
    harness.engine.pause();
    assert_eq!(harness.engine.sync().state, SessionState::Paused);

    harness.advance(5);
    harness.engine.resume();
    let status = harness.engine.sync();
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.accumulated_paused_secs, 5);

    harness.advance(10);
    harness.engine.tick();
    let status = harness.engine.sync();
    assert_eq!(status.elapsed_secs, 20);
}

#[test]
fn pause_and_resume_out_of_state_are_ignored() {
    let harness = Harness::new(test_config());
    harness.engine.pause();
    harness.engine.resume();
    assert_eq!(harness.engine.sync().state, SessionState::Idle);

    harness.start();
    harness.engine.resume();
    assert_eq!(harness.engine.sync().state, SessionState::Active);
    harness.engine.pause();
    harness.engine.pause();
    harness.engine.sync();
    harness.advance(3);
    harness.engine.resume();
    assert_eq!(harness.engine.sync().accumulated_paused_secs, 3);
}

#[test]
fn movement_while_paused_is_not_counted() {
    let harness = Harness::new(test_config());
    harness.start();
    let inbox = harness.engine.sender();

    inbox.send(EngineMessage::Location(fix(0, 0.0))).unwrap();
    inbox.send(EngineMessage::Location(fix(10, 10.0))).unwrap();
    harness.engine.pause();
    inbox.send(EngineMessage::Location(fix(20, 500.0))).unwrap();
    harness.engine.resume();
    inbox.send(EngineMessage::Location(fix(30, 510.0))).unwrap();
    inbox.send(EngineMessage::Location(fix(40, 520.0))).unwrap();

    let status = harness.engine.sync();
    assert!(
        (status.distance_km - 0.02).abs() < 0.0005,
        "distance was {}",
        status.distance_km
    );
}

#[test]
fn late_backend_confirmation_still_activates_the_session() {
    let mut config = test_config();
    config.lifecycle.start_timeout_ms = 50;
    let harness = Harness::new(config);
    harness.backend.set_create_delay(Duration::from_millis(300));

    let err = harness
        .engine
        .request_start(20.0, 80.0, None)
        .expect_err("caller gives up");
    assert_eq!(err, StartError::Timeout);

    let status = wait_for(&harness.engine, WAIT, |s| s.state == SessionState::Active);
    assert!(status.session_id.is_some());
    assert_eq!(harness.backend.create_calls(), 1);
}

#[test]
fn discarding_while_starting_ignores_the_late_session() {
    let mut config = test_config();
    config.lifecycle.start_timeout_ms = 50;
    let harness = Harness::new(config);
    harness.backend.set_create_delay(Duration::from_millis(200));

    assert!(harness.engine.request_start(20.0, 80.0, None).is_err());
    harness.engine.stop(false);
    assert_eq!(harness.engine.sync().state, SessionState::Discarded);

    std::thread::sleep(Duration::from_millis(400));
    let status = harness.engine.sync();
    assert_eq!(status.state, SessionState::Discarded);
    assert!(status.session_id.is_none());
}

#[test]
fn finalized_stop_delivers_completion_and_clears_snapshot() {
    let harness = Harness::new(test_config());
    let session_id = harness.start();
    let inbox = harness.engine.sender();
    inbox.send(EngineMessage::Location(fix(0, 0.0))).unwrap();
    inbox.send(EngineMessage::Location(fix(30, 20.0))).unwrap();
    harness.advance(60);
    harness.engine.stop(true);

    wait_for(&harness.engine, WAIT, |s| s.state == SessionState::Completed);

    let completions = harness.backend.completions();
    assert_eq!(completions.len(), 1);
    let (completed_id, aggregates) = &completions[0];
    assert_eq!(completed_id, &session_id);
    assert_eq!(aggregates.duration_seconds, 60);
    assert!((aggregates.distance_km - 0.02).abs() < 0.0005);
    assert!(aggregates.calories_burned > 0.0);
    assert_eq!(harness.backend.locations().len(), 2);

    harness.engine.sync();
    let store = SessionStore::open(harness.store_path.clone()).unwrap();
    assert!(store.load().unwrap().is_none());
}

#[test]
fn engine_accepts_a_new_session_after_completion() {
    let harness = Harness::new(test_config());
    let first = harness.start();
    harness.engine.stop(true);
    wait_for(&harness.engine, WAIT, |s| s.state == SessionState::Completed);

    let second = harness.start();
    assert_ne!(first, second);
    assert_eq!(harness.engine.sync().distance_km, 0.0);
}

#[test]
fn persistence_failure_discards_the_session() {
    let harness = Harness::new(test_config());
    harness.start();
    harness.engine.sync();

    for suffix in ["", "-wal", "-shm"] {
        let path = format!("{}{}", harness.store_path.display(), suffix);
        let _ = std::fs::remove_file(path);
    }
    std::fs::create_dir(&harness.store_path).unwrap();

    harness.engine.pause();
    let status = wait_for(&harness.engine, WAIT, |s| s.state == SessionState::Discarded);
    let error = status.last_error.expect("last error set");
    assert!(error.contains("persistence"), "unexpected error {}", error);
}

#[test]
fn paused_time_never_counts_for_any_pause_resume_interleaving() {
    let harness = Harness::new(test_config());
    harness.start();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut paused = false;
    let mut expected_active = 0;

    for _ in 0..200 {
        match rng.gen_range(0..4) {
            0 => {
                harness.engine.pause();
                paused = true;
            }
            1 => {
                harness.engine.resume();
                paused = false;
            }
            2 => harness.engine.tick(),
            _ => {
                let secs = rng.gen_range(0..8);
                harness.advance(secs);
                if !paused {
                    expected_active += secs;
                }
            }
        }
        let status = harness.engine.sync();
        let expected_state = if paused {
            SessionState::Paused
        } else {
            SessionState::Active
        };
        assert_eq!(status.state, expected_state);
        assert_eq!(status.elapsed_secs, expected_active);
    }
}

#[test]
fn backfilled_heart_rate_reaches_the_backend_in_timestamp_order() {
    let recorded = (1..50).map(|secs| heart_rate(secs, 100)).collect();
    let harness = Harness::with(test_config(), |c| {
        c.with_health(Box::new(ScriptedHealth::new(recorded)))
    });
    harness.start();

    // Live readings only start 50 s in; the first 50 s are a gap.
    let inbox = harness.engine.sender();
    for secs in 50..55 {
        harness.clock.set(t0() + ChronoDuration::seconds(secs));
        inbox
            .send(EngineMessage::HeartRate {
                source: HeartRateSourceKind::Local,
                sample: heart_rate(secs, 120),
            })
            .unwrap();
    }
    harness.engine.sync();
    harness.advance(60);
    harness.engine.tick();
    std::thread::sleep(Duration::from_millis(200));
    harness.engine.sync();
    assert!(harness.backend.heart_rates().is_empty());

    harness.engine.stop(true);
    wait_for(&harness.engine, WAIT, |s| s.state == SessionState::Completed);
    wait_until(WAIT, || harness.backend.completions().len() == 1);

    let delivered: Vec<i64> = harness
        .backend
        .heart_rates()
        .iter()
        .map(|sample| (sample.timestamp - t0()).num_seconds())
        .collect();
    assert_eq!(delivered, (1..55).collect::<Vec<i64>>());
    let (_, aggregates) = &harness.backend.completions()[0];
    assert_eq!(aggregates.max_heart_rate, Some(120));
}
