//! End-to-end scans against the simulated devices.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{two_by_two, Rig};
use parking_lot::Mutex;
use scope_core::capabilities::StageDriver;
use scope_core::config::{FocusPolicy, RasterOrder, StageFaultPolicy};
use scope_core::error::{AbortReason, ScopeError};
use scope_core::types::{Axis, AxisDirection, ImagingMode, Led, StagePosition};
use scope_driver_mock::{
    CameraCommand, ErrorConfig, ErrorScenario, MockMode, SimulatedCamera, SimulatedStage,
    SpecimenKind, StageCommand,
};
use scope_scan::{
    FieldOutcome, LeaseProvider, LeaseToken, ScanEvent, ScanOrchestrator, ScanOutcome, ScanState,
};

#[tokio::test(start_paused = true)]
async fn clean_grid_completes_with_every_field_captured() {
    let rig = Rig::new();
    let run = rig.orchestrator.run(two_by_two()).await.unwrap();

    assert_eq!(run.outcome, ScanOutcome::Completed);
    assert_eq!(run.fields.len(), 4);
    assert_eq!(run.count(FieldOutcome::Captured), 4);
    assert_eq!(rig.sink.len(), 4);

    let cells: HashSet<_> = run
        .fields
        .iter()
        .map(|f| (f.position.row, f.position.column))
        .collect();
    assert_eq!(cells.len(), 4);

    for field in &run.fields {
        let focus = field.focus_position.unwrap();
        assert!((focus - 0.5).abs() < 0.02, "field {:?}", field.position);
        assert_eq!(field.autofocus_attempts, 1);
        assert!(field.image.is_some());
    }

    assert_eq!(
        rig.moves(),
        vec![
            StagePosition::new(0, 0, 0),
            StagePosition::new(100, 0, 0),
            StagePosition::new(100, 100, 0),
            StagePosition::new(0, 100, 0),
        ]
    );
    assert_eq!(rig.disable_count(), 1);
    assert_eq!(rig.stage_commands().last(), Some(&StageCommand::DisableMotors));
    assert!(!rig.orchestrator.is_running());
}

#[tokio::test(start_paused = true)]
async fn limit_hit_aborts_with_stage_fault() {
    let rig = Rig::new();
    rig.stage.trigger_limit_at(StagePosition::new(0, 100, 0), Axis::Y);

    let config = scope_core::config::ScanConfiguration {
        order: RasterOrder::RowMajor,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    assert_eq!(
        run.outcome,
        ScanOutcome::AbortedAt {
            row: 1,
            column: 0,
            reason: AbortReason::StageFault
        }
    );
    assert_eq!(run.fields.len(), 3);
    assert_eq!(run.fields[2].outcome, FieldOutcome::StageFault);
    assert_eq!((run.fields[2].position.row, run.fields[2].position.column), (1, 0));
    assert_eq!(rig.captures(), 2);
    assert_eq!(rig.moves().last(), Some(&StagePosition::new(0, 100, 0)));
    assert_eq!(rig.stage_commands().last(), Some(&StageCommand::DisableMotors));
}

#[tokio::test(start_paused = true)]
async fn limit_hit_is_skipped_under_skip_policy() {
    let rig = Rig::new();
    rig.stage.trigger_limit_at(StagePosition::new(0, 100, 0), Axis::Y);

    let config = scope_core::config::ScanConfiguration {
        order: RasterOrder::RowMajor,
        stage_fault_policy: StageFaultPolicy::Skip,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    assert_eq!(run.outcome, ScanOutcome::Completed);
    assert_eq!(run.count(FieldOutcome::Captured), 3);
    assert_eq!(run.count(FieldOutcome::StageFault), 1);
    assert_eq!(rig.sink.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn autofocus_budget_exhaustion_is_fatal() {
    let rig = Rig::with(
        SimulatedStage::builder(),
        SimulatedCamera::builder().specimen_kind(SpecimenKind::Blank),
    );
    let config = scope_core::config::ScanConfiguration {
        max_autofocus_failures: 2,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    assert_eq!(
        run.outcome,
        ScanOutcome::FatalHardwareError {
            reason: AbortReason::AutofocusBudgetExceeded,
            at: Some((1, 1)),
        }
    );
    let outcomes: Vec<_> = run.fields.iter().map(|f| f.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            FieldOutcome::AutofocusFailed,
            FieldOutcome::AutofocusFailed,
            FieldOutcome::Aborted
        ]
    );
    assert_eq!(run.autofocus_failures, 3);

    // Failed fields are still imaged at the best-effort position.
    assert_eq!(run.images(), 2);
    assert_eq!(rig.captures(), 2);

    // Nothing moves, focuses or captures once the budget is gone.
    let entries = rig.log.entries();
    let last_focus = entries
        .iter()
        .rposition(|e| {
            matches!(
                e,
                scope_driver_mock::LoggedCommand::Camera(CameraCommand::SetFocusPosition(_))
            )
        })
        .unwrap();
    let after: Vec<_> = entries[last_focus + 1..].to_vec();
    assert!(after.iter().all(|e| match e {
        scope_driver_mock::LoggedCommand::Stage(c) => !c.is_motion(),
        scope_driver_mock::LoggedCommand::Camera(c) => !matches!(
            c,
            CameraCommand::CaptureImage | CameraCommand::SetFocusPosition(_)
        ),
    }));
    assert_eq!(rig.moves().len(), 3);
    assert_eq!(rig.disable_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_focus_without_capture_policy_records_no_image() {
    let rig = Rig::with(
        SimulatedStage::builder(),
        SimulatedCamera::builder().specimen_kind(SpecimenKind::Blank),
    );
    let config = scope_core::config::ScanConfiguration {
        rows: 1,
        columns: 2,
        max_autofocus_failures: 5,
        capture_on_autofocus_failure: false,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    assert_eq!(run.outcome, ScanOutcome::Completed);
    assert_eq!(run.count(FieldOutcome::AutofocusFailed), 2);
    assert_eq!(run.images(), 0);
    assert_eq!(rig.captures(), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_count_against_budget() {
    let rig = Rig::with(
        SimulatedStage::builder(),
        SimulatedCamera::builder().specimen_kind(SpecimenKind::Blank),
    );
    let config = scope_core::config::ScanConfiguration {
        autofocus_attempts_per_field: 3,
        max_autofocus_failures: 4,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    // Field one burns three attempts, field two exceeds the budget on its second.
    assert_eq!(run.fields[0].autofocus_attempts, 3);
    assert_eq!(run.fields[0].outcome, FieldOutcome::AutofocusFailed);
    assert_eq!(run.fields[1].outcome, FieldOutcome::Aborted);
    assert_eq!(run.fields[1].autofocus_attempts, 2);
    assert_eq!(run.autofocus_failures, 5);
    assert_eq!(
        run.outcome.reason(),
        Some(AbortReason::AutofocusBudgetExceeded)
    );
}

#[tokio::test(start_paused = true)]
async fn reuses_focus_between_refocus_fields() {
    let rig = Rig::new();
    let config = scope_core::config::ScanConfiguration {
        refocus_interval: 2,
        focus_policy: FocusPolicy::ReuseBetweenRefocus,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();

    let attempts: Vec<_> = run.fields.iter().map(|f| f.autofocus_attempts).collect();
    assert_eq!(attempts, vec![1, 0, 1, 0]);
    assert_eq!(run.fields[1].focus_position, run.fields[0].focus_position);
    assert_eq!(run.count(FieldOutcome::Captured), 4);
}

#[tokio::test(start_paused = true)]
async fn every_field_policy_refocuses_each_field() {
    let rig = Rig::new();
    let config = scope_core::config::ScanConfiguration {
        refocus_interval: 2,
        focus_policy: FocusPolicy::EveryField,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();
    assert!(run.fields.iter().all(|f| f.autofocus_attempts == 1));
}

/// Signed x travel of every motion command, replayed from the origin.
fn x_travel(commands: &[StageCommand]) -> Vec<i64> {
    let mut x = 0i64;
    commands
        .iter()
        .filter_map(|c| match c {
            StageCommand::MoveTo(p) => {
                let travel = p.x - x;
                x = p.x;
                Some(travel)
            }
            StageCommand::MoveRelative {
                direction, steps, ..
            } if direction.axis() == Axis::X => {
                let travel = direction.axis_direction().sign() * i64::from(*steps);
                x += travel;
                Some(travel)
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn backlash_adds_travel_on_reversal() {
    let rig = Rig::new();
    let config = scope_core::config::ScanConfiguration {
        backlash: 10,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();
    assert!(run.outcome.is_completed());

    let commands = rig.stage_commands();
    let relative: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            StageCommand::MoveRelative {
                direction,
                steps,
                disable_after,
                ..
            } => Some((*direction, *steps, *disable_after)),
            _ => None,
        })
        .collect();

    // Only the last move (100,100) -> (0,100) reverses x. The pre-load runs
    // in the previous (+x) direction.
    assert_eq!(relative.len(), 1);
    let (direction, steps, disable_after) = relative[0];
    assert_eq!(direction.axis(), Axis::X);
    assert_eq!(direction.axis_direction(), AxisDirection::Positive);
    assert_eq!(steps, 10);
    assert!(!disable_after);

    // Full commanded x path: 0 -> 0 -> 100 -> 100, then +10 and -110.
    let travel: Vec<i64> = x_travel(&commands)
        .into_iter()
        .filter(|&t| t != 0)
        .collect();
    assert_eq!(travel, vec![100, 10, -110]);

    let negative: i64 = travel.iter().filter(|&&t| t < 0).map(|t| -t).sum();
    assert_eq!(negative, 100 + 10);
    assert_eq!(rig.stage.state().await.unwrap().position, StagePosition::new(0, 100, 0));
}

#[tokio::test(start_paused = true)]
async fn backlash_adds_nothing_without_reversal() {
    let rig = Rig::new();
    let config = scope_core::config::ScanConfiguration {
        rows: 1,
        columns: 3,
        backlash: 10,
        ..two_by_two()
    };
    let run = rig.orchestrator.run(config).await.unwrap();
    assert!(run.outcome.is_completed());

    let commands = rig.stage_commands();
    assert!(!commands
        .iter()
        .any(|c| matches!(c, StageCommand::MoveRelative { .. })));
    let travel: i64 = x_travel(&commands).iter().map(|t| t.abs()).sum();
    assert_eq!(travel, 200);
}

#[tokio::test(start_paused = true)]
async fn capture_failure_follows_stage_fault_policy() {
    let rig = Rig::with(
        SimulatedStage::builder(),
        SimulatedCamera::builder().error_config(ErrorConfig::scenario(
            ErrorScenario::FailAfterN {
                operation: "capture_image",
                count: 1,
            },
        )),
    );
    let run = rig.orchestrator.run(two_by_two()).await.unwrap();

    assert_eq!(
        run.outcome,
        ScanOutcome::AbortedAt {
            row: 0,
            column: 1,
            reason: AbortReason::CaptureFailed
        }
    );
    assert_eq!(run.fields[1].outcome, FieldOutcome::StageFault);
    assert!(run.fields[1].image.is_none());
    assert_eq!(rig.sink.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fluorescence_mode_configures_camera_and_leds() {
    let rig = Rig::with(
        SimulatedStage::builder(),
        SimulatedCamera::builder().specimen_kind(SpecimenKind::Fluorescent),
    );
    let config = scope_core::config::ScanConfiguration {
        rows: 1,
        columns: 1,
        imaging_mode: ImagingMode::Fluorescence,
        ..two_by_two()
    };
    let settings = config.fluorescence;
    let run = rig.orchestrator.run(config).await.unwrap();
    assert!(run.outcome.is_completed());

    let camera = rig.log.camera_commands();
    assert!(camera.contains(&CameraCommand::SetExposure {
        exposure_ms: settings.exposure_ms,
        iso: settings.iso,
    }));
    assert!(camera.contains(&CameraCommand::SetFocusMode(
        scope_core::types::FocusMode::Contrast
    )));

    let stage = rig.stage_commands();
    assert!(stage.contains(&StageCommand::SetLed(Led::Brightfield, 0)));
    assert!(stage.contains(&StageCommand::SetLed(Led::Fluorescent, settings.illumination)));

    // Teardown leaves both LEDs dark and the camera unlocked.
    assert_eq!(rig.stage.led_level(Led::Fluorescent), 0);
    assert_eq!(rig.stage.led_level(Led::Brightfield), 0);
    assert!(!rig.camera.focus_locked());
    assert!(!rig.camera.exposure_locked());
    assert!(!rig.camera.is_previewing());
}

#[tokio::test(start_paused = true)]
async fn disconnected_stage_is_fatal_before_any_motion() {
    let rig = Rig::new();
    rig.stage.disconnect();

    let run = rig.orchestrator.run(two_by_two()).await.unwrap();
    assert_eq!(
        run.outcome,
        ScanOutcome::FatalHardwareError {
            reason: AbortReason::HardwareDisconnected,
            at: None
        }
    );
    assert!(run.fields.is_empty());
    assert!(rig.moves().is_empty());
    assert_eq!(rig.captures(), 0);
}

#[tokio::test(start_paused = true)]
async fn mid_run_disconnect_stops_all_commands() {
    let rig = Rig::new();
    let mut events = rig.orchestrator.subscribe();
    let stage = rig.stage.clone();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ScanEvent::Field { .. } = event {
                stage.disconnect();
                break;
            }
        }
    });

    let run = rig.orchestrator.run(two_by_two()).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(
        run.outcome.reason(),
        Some(AbortReason::HardwareDisconnected)
    );
    assert!(matches!(run.outcome, ScanOutcome::FatalHardwareError { .. }));
    assert!(run.count(FieldOutcome::Captured) < 4);
    // A disconnected stage gets no teardown traffic.
    assert_eq!(rig.disable_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn realistic_devices_complete_a_scan() {
    let rig = Rig::with(
        SimulatedStage::builder().mode(MockMode::Realistic),
        SimulatedCamera::builder().mode(MockMode::Realistic),
    );
    let run = rig.orchestrator.run(two_by_two()).await.unwrap();
    assert_eq!(run.outcome, ScanOutcome::Completed);
    assert_eq!(run.count(FieldOutcome::Captured), 4);
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_is_rejected_before_hardware() {
    let rig = Rig::new();
    let config = scope_core::config::ScanConfiguration {
        rows: 0,
        ..two_by_two()
    };
    let err = rig.orchestrator.run(config).await.unwrap_err();
    assert!(matches!(err, ScopeError::ConfigurationInvalid(_)));
    assert!(rig.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn grid_overflowing_step_range_is_rejected_before_hardware() {
    let rig = Rig::new();
    let mut config = scope_core::config::ScanConfiguration {
        rows: 1,
        columns: 4,
        ..two_by_two()
    };
    config.spacing.x = i64::MAX / 2;
    let err = rig.orchestrator.run(config).await.unwrap_err();
    assert!(matches!(err, ScopeError::ConfigurationInvalid(_)));
    assert!(rig.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_run_while_busy_is_refused() {
    let rig = Rig::with(
        SimulatedStage::builder().mode(MockMode::Realistic),
        SimulatedCamera::builder().mode(MockMode::Realistic),
    );
    let orchestrator = rig.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.run(two_by_two()).await });

    let mut state = rig.orchestrator.state();
    state
        .wait_for(|s| *s != ScanState::Idle)
        .await
        .unwrap();

    let err = rig.orchestrator.run(two_by_two()).await.unwrap_err();
    assert!(matches!(err, ScopeError::ScanInProgress));

    let run = first.await.unwrap().unwrap();
    assert!(run.outcome.is_completed());
}

#[tokio::test(start_paused = true)]
async fn events_bracket_the_run() {
    let rig = Rig::new();
    let mut events = rig.orchestrator.subscribe();
    let run = rig.orchestrator.run(two_by_two()).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ScanEvent::Started { rows: 2, columns: 2, .. })));
    assert!(matches!(
        seen.last(),
        Some(ScanEvent::Finished {
            outcome: ScanOutcome::Completed,
            ..
        })
    ));
    let fields = seen
        .iter()
        .filter(|e| matches!(e, ScanEvent::Field { .. }))
        .count();
    assert_eq!(fields, run.fields.len());
    assert!(seen.iter().any(|e| matches!(
        e,
        ScanEvent::State {
            state: ScanState::Completed,
            ..
        }
    )));
}

#[derive(Default)]
struct CountingLeases {
    open: Mutex<i64>,
    granted: Mutex<u64>,
}

impl LeaseProvider for CountingLeases {
    fn begin(&self, _label: &str) -> LeaseToken {
        *self.open.lock() += 1;
        let mut granted = self.granted.lock();
        *granted += 1;
        LeaseToken(*granted)
    }

    fn end(&self, _token: LeaseToken) {
        *self.open.lock() -= 1;
    }
}

#[tokio::test(start_paused = true)]
async fn execution_lease_spans_each_run() {
    let leases = Arc::new(CountingLeases::default());
    let stage = SimulatedStage::builder().build();
    let camera = SimulatedCamera::builder().build();
    let orchestrator = ScanOrchestrator::new(
        Arc::new(stage),
        Arc::new(camera),
        Arc::new(scope_scan::MemoryImageSink::new()),
    )
    .with_lease_provider(leases.clone());

    orchestrator.run(two_by_two()).await.unwrap();
    orchestrator.run(two_by_two()).await.unwrap();

    assert_eq!(*leases.open.lock(), 0);
    assert_eq!(*leases.granted.lock(), 2);
}
