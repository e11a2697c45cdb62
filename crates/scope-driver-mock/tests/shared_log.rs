//! Stage and camera sharing one command log.

use std::time::Duration;

use scope_core::capabilities::{CameraDriver, StageDriver};
use scope_core::types::{Led, StagePosition};
use scope_driver_mock::{
    CameraCommand, CommandLog, ErrorConfig, ErrorScenario, LoggedCommand, SimulatedCamera,
    SimulatedStage, StageCommand,
};

#[tokio::test]
async fn interleaves_stage_and_camera_commands() {
    let log = CommandLog::new();
    let stage = SimulatedStage::builder().command_log(log.clone()).build();
    let camera = SimulatedCamera::builder().command_log(log.clone()).build();

    camera.set_up().await.unwrap();
    stage.move_to(StagePosition::new(5, 5, 0)).await.unwrap();
    stage
        .wait_for_motion_complete(Duration::from_secs(1))
        .await
        .unwrap();
    camera.capture_image().await.unwrap();
    stage.set_led(Led::Brightfield, 0).await.unwrap();

    assert_eq!(
        log.entries(),
        vec![
            LoggedCommand::Camera(CameraCommand::SetUp),
            LoggedCommand::Stage(StageCommand::MoveTo(StagePosition::new(5, 5, 0))),
            LoggedCommand::Stage(StageCommand::WaitForMotion),
            LoggedCommand::Camera(CameraCommand::CaptureImage),
            LoggedCommand::Stage(StageCommand::SetLed(Led::Brightfield, 0)),
        ]
    );
    assert_eq!(log.stage_commands().len(), 3);
    assert_eq!(log.camera_commands().len(), 2);
}

#[tokio::test]
async fn communication_loss_disconnects_stage() {
    let stage = SimulatedStage::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::CommunicationLoss {
            after: 2,
        }))
        .build();

    stage.move_to(StagePosition::new(1, 0, 0)).await.unwrap();
    stage.move_to(StagePosition::new(2, 0, 0)).await.unwrap();
    assert!(stage.is_connected().await);

    let err = stage.move_to(StagePosition::new(3, 0, 0)).await.unwrap_err();
    assert!(err.is_disconnect());
    assert!(!stage.is_connected().await);
}

#[tokio::test]
async fn injected_capture_failure() {
    let camera = SimulatedCamera::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "capture_image",
            count: 1,
        }))
        .build();
    camera.set_up().await.unwrap();
    assert!(camera.capture_image().await.is_ok());
    assert!(camera.capture_image().await.is_err());
}
