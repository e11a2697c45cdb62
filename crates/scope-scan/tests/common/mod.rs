//! Shared test rig: simulated stage and camera on one command log.

#![allow(dead_code)]

use std::sync::Arc;

use scope_core::config::ScanConfiguration;
use scope_core::types::StagePosition;
use scope_driver_mock::{
    CameraCommand, CommandLog, SimulatedCamera, SimulatedCameraBuilder, SimulatedStage,
    SimulatedStageBuilder, StageCommand,
};
use scope_scan::{MemoryImageSink, ScanOrchestrator};

pub struct Rig {
    pub stage: SimulatedStage,
    pub camera: SimulatedCamera,
    pub sink: Arc<MemoryImageSink>,
    pub log: CommandLog,
    pub orchestrator: Arc<ScanOrchestrator>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(SimulatedStage::builder(), SimulatedCamera::builder())
    }

    pub fn with(stage: SimulatedStageBuilder, camera: SimulatedCameraBuilder) -> Self {
        let log = CommandLog::new();
        let stage = stage.command_log(log.clone()).build();
        let camera = camera.command_log(log.clone()).build();
        let sink = Arc::new(MemoryImageSink::new());
        let orchestrator = Arc::new(ScanOrchestrator::new(
            Arc::new(stage.clone()),
            Arc::new(camera.clone()),
            sink.clone(),
        ));
        Self {
            stage,
            camera,
            sink,
            log,
            orchestrator,
        }
    }

    pub fn stage_commands(&self) -> Vec<StageCommand> {
        self.log.stage_commands()
    }

    pub fn moves(&self) -> Vec<StagePosition> {
        self.stage_commands()
            .into_iter()
            .filter_map(|c| match c {
                StageCommand::MoveTo(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn disable_count(&self) -> usize {
        self.stage_commands()
            .iter()
            .filter(|c| **c == StageCommand::DisableMotors)
            .count()
    }

    pub fn captures(&self) -> usize {
        self.log
            .camera_commands()
            .iter()
            .filter(|c| **c == CameraCommand::CaptureImage)
            .count()
    }
}

/// 2 × 2 grid, spacing (100, 100), origin at zero, one autofocus failure allowed.
pub fn two_by_two() -> ScanConfiguration {
    ScanConfiguration {
        rows: 2,
        columns: 2,
        origin: Some(StagePosition::new(0, 0, 0)),
        max_autofocus_failures: 1,
        ..ScanConfiguration::default()
    }
}
