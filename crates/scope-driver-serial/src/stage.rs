//! Stepper stage board driver.
//!
//! The board accepts one command at a time over the link and answers each
//! with a single line (see [`crate::protocol`]). The driver serializes all
//! traffic through the shared port lock, so a query can never read another
//! command's reply.
//!
//! Direction bookkeeping is local: the board does not report which way an
//! axis last travelled, so every accepted motion command updates
//! [`AxisDirections`] before it returns. Preset moves follow a path the
//! firmware chooses, so they forget the directions of the axes they move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use scope_core::capabilities::StageDriver;
use scope_core::error::{DriverError, DriverErrorKind, DriverResult};
use scope_core::limits::COMMAND_TIMEOUT;
use scope_core::serial::{drain_serial_buffer, open_serial_async, wrap_shared, DynSerial, SharedPort};
use scope_core::types::{
    Axis, AxisDirection, AxisDirections, BoardStatus, Led, LimitFlags, NamedPosition,
    StageDirection, StagePosition, StageState,
};

use crate::protocol::{self, DRIVER_TYPE, IDENT_PREFIX};

/// Default link speed of the stage board.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Interval between motion-status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long stale bytes are drained after an unanswered command.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Retry policy for idempotent queries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(50),
        }
    }
}

/// Stage driver speaking the board's ASCII protocol.
pub struct SerialStage {
    port: SharedPort,
    timeout: Duration,
    retry: RetryPolicy,
    connected: AtomicBool,
    directions: Mutex<AxisDirections>,
}

impl SerialStage {
    /// Open `port_path` and validate that a stage board answers.
    ///
    /// # Errors
    ///
    /// `Initialization` when the port cannot be opened or the device does not
    /// identify as a stage board.
    pub async fn new_async(port_path: &str, baud_rate: u32) -> DriverResult<Self> {
        let stream = open_serial_async(port_path, baud_rate, DRIVER_TYPE).await?;
        let stage = Self::connect(Box::new(stream)).await?;
        debug!(port = port_path, baud_rate, "stage board connected");
        Ok(stage)
    }

    /// Validate a stage board on an already open transport.
    pub async fn connect(transport: DynSerial) -> DriverResult<Self> {
        let stage = Self::from_port(wrap_shared(transport));
        let ident = stage.transact("VE?").await.map_err(|e| {
            DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Initialization,
                format!("stage board did not identify: {}", e.message),
            )
        })?;
        if !ident.starts_with(IDENT_PREFIX) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Initialization,
                format!("unexpected identification '{}'", ident),
            ));
        }
        Ok(stage)
    }

    fn from_port(port: SharedPort) -> Self {
        Self {
            port,
            timeout: COMMAND_TIMEOUT,
            retry: RetryPolicy::default(),
            connected: AtomicBool::new(true),
            directions: Mutex::new(AxisDirections::default()),
        }
    }

    /// Skip identification, for tests driving a scripted board.
    #[cfg(test)]
    pub(crate) fn with_test_port(port: SharedPort) -> Self {
        Self::from_port(port)
    }

    /// Per-command reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry policy for queries.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn link_lost(&self, detail: impl std::fmt::Display) -> DriverError {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(%detail, "stage board link lost");
        }
        DriverError::new(
            DRIVER_TYPE,
            DriverErrorKind::Disconnected,
            format!("stage board link lost: {}", detail),
        )
    }

    /// Send one command and read its reply line.
    async fn transact(&self, command: &str) -> DriverResult<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DriverError::disconnected(DRIVER_TYPE));
        }

        let mut port = self.port.lock().await;

        let line = format!("{}\r\n", command);
        let writer = port.get_mut();
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            return Err(self.link_lost(e));
        }
        if let Err(e) = writer.flush().await {
            return Err(self.link_lost(e));
        }

        let mut response = String::new();
        match tokio::time::timeout(self.timeout, port.read_line(&mut response)).await {
            Err(_) => {
                let dropped = drain_serial_buffer(port.get_mut(), DRAIN_WINDOW).await;
                Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Timeout,
                    format!(
                        "no reply to '{}' within {:?} ({} stale bytes dropped)",
                        command, self.timeout, dropped
                    ),
                ))
            }
            Ok(Err(e)) => Err(self.link_lost(e)),
            Ok(Ok(0)) => Err(self.link_lost("end of stream")),
            Ok(Ok(_)) => Ok(response.trim().to_string()),
        }
    }

    /// Command that answers `OK`.
    async fn send_command(&self, command: &str) -> DriverResult<()> {
        let reply = self.transact(command).await?;
        protocol::expect_ok(&reply)
    }

    /// Idempotent query, retried on timeouts and garbled replies.
    async fn query<T>(
        &self,
        command: &str,
        parse: impl Fn(&str) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let parse = &parse;
        self.with_retry(command, move || async move {
            let reply = self.transact(command).await?;
            parse(&reply)
        })
        .await
    }

    async fn with_retry<F, Fut, T>(&self, operation: &str, mut op: F) -> DriverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = DriverResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e)
                    if attempt < self.retry.max_attempts
                        && matches!(e.kind, DriverErrorKind::Timeout | DriverErrorKind::Protocol) =>
                {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "stage query failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_direction(&self, axis: Axis, direction: AxisDirection) {
        self.directions.lock().set(axis, direction);
    }

    /// Last commanded direction per axis.
    pub fn last_direction(&self) -> AxisDirections {
        *self.directions.lock()
    }
}

#[async_trait]
impl StageDriver for SerialStage {
    #[instrument(skip(self), err)]
    async fn move_to(&self, target: StagePosition) -> DriverResult<()> {
        let from = self.read_position().await?;
        self.send_command(&protocol::move_absolute(target)).await?;
        for axis in Axis::ALL {
            if let Some(direction) = AxisDirection::of_delta(target.get(axis) - from.get(axis)) {
                self.record_direction(axis, direction);
            }
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn move_relative(
        &self,
        direction: StageDirection,
        steps: u32,
        stop_on_limit: bool,
        disable_after: bool,
    ) -> DriverResult<()> {
        self.send_command(&protocol::move_relative(
            direction,
            steps,
            stop_on_limit,
            disable_after,
        ))
        .await?;
        if steps > 0 {
            self.record_direction(direction.axis(), direction.axis_direction());
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn wait_for_motion_complete(&self, timeout: Duration) -> DriverResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.query("MS?", protocol::parse_moving).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Timeout,
                    format!("stage still moving after {:?}", timeout),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_position(&self) -> DriverResult<StagePosition> {
        self.query("TP?", protocol::parse_position).await
    }

    async fn read_limit_flags(&self) -> DriverResult<LimitFlags> {
        self.query("LS?", protocol::parse_limits).await
    }

    async fn state(&self) -> DriverResult<StageState> {
        let position = self.read_position().await?;
        let limits = self.read_limit_flags().await?;
        Ok(StageState {
            position,
            limits,
            connected: self.connected.load(Ordering::SeqCst),
            last_direction: self.last_direction(),
        })
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), err)]
    async fn set_step_interval(&self, interval: Duration) -> DriverResult<()> {
        self.send_command(&protocol::step_interval(interval)).await
    }

    #[instrument(skip(self), err)]
    async fn disable_motors(&self) -> DriverResult<()> {
        self.send_command("MO").await
    }

    #[instrument(skip(self), err)]
    async fn move_to_named(&self, position: NamedPosition) -> DriverResult<()> {
        self.send_command(&format!("NP {}", protocol::preset_code(position)))
            .await?;
        let mut directions = self.directions.lock();
        match position {
            NamedPosition::ZHome | NamedPosition::ZDown => directions.z = None,
            _ => {
                directions.x = None;
                directions.y = None;
            }
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_led(&self, led: Led, level: u8) -> DriverResult<()> {
        self.send_command(&protocol::set_led(led, level)).await
    }

    async fn request_status(&self) -> DriverResult<BoardStatus> {
        self.query("ST?", protocol::parse_status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Serve `respond` on the board end of a duplex pipe. `None` leaves the
    /// command unanswered. Every received line is appended to the returned log.
    fn board<F>(respond: F) -> (SharedPort, Arc<Mutex<Vec<String>>>)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let (host, device) = tokio::io::duplex(1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(device, respond, log.clone()));
        (wrap_shared(Box::new(host)), log)
    }

    async fn serve<F>(device: DuplexStream, mut respond: F, log: Arc<Mutex<Vec<String>>>)
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut device = BufReader::new(device);
        let mut line = String::new();
        loop {
            line.clear();
            match device.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let command = line.trim().to_string();
            log.lock().push(command.clone());
            if let Some(reply) = respond(&command) {
                if device
                    .get_mut()
                    .write_all(format!("{}\r\n", reply).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    /// Tiny board model: absolute position, moving for `busy_polls` polls.
    fn firmware(busy_polls: u32) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        let mut position = StagePosition::default();
        let mut remaining = 0u32;
        move |command| {
            let parts: Vec<&str> = command.split_whitespace().collect();
            let reply = match parts.as_slice() {
                ["VE?"] => "SCOPE-STAGE 3".to_string(),
                ["TP?"] => format!("{} {} {}", position.x, position.y, position.z),
                ["LS?"] => "0 0 0".to_string(),
                ["MS?"] => {
                    if remaining > 0 {
                        remaining -= 1;
                        "1".to_string()
                    } else {
                        "0".to_string()
                    }
                }
                ["MA", x, y, z] => {
                    position = StagePosition::new(
                        x.parse().unwrap(),
                        y.parse().unwrap(),
                        z.parse().unwrap(),
                    );
                    remaining = busy_polls;
                    "OK".to_string()
                }
                ["MR", dir, steps, _, _] => {
                    let steps: i64 = steps.parse().unwrap();
                    match *dir {
                        "L" => position.x -= steps,
                        "R" => position.x += steps,
                        "D" => position.y -= steps,
                        "U" => position.y += steps,
                        "FD" => position.z -= steps,
                        _ => position.z += steps,
                    }
                    remaining = busy_polls;
                    "OK".to_string()
                }
                ["ST?"] => "7.4 23.5 41 3".to_string(),
                ["SI", _] | ["MO"] | ["NP", _] | ["LED", _, _] => "OK".to_string(),
                _ => "ERR ARG unknown command".to_string(),
            };
            Some(reply)
        }
    }

    #[tokio::test]
    async fn move_to_tracks_position_and_directions() {
        let (port, log) = board(firmware(0));
        let stage = SerialStage::with_test_port(port);

        stage.move_to(StagePosition::new(100, -20, 0)).await.unwrap();
        stage.wait_for_motion_complete(Duration::from_secs(1)).await.unwrap();

        let state = stage.state().await.unwrap();
        assert_eq!(state.position, StagePosition::new(100, -20, 0));
        assert!(state.connected);
        assert_eq!(state.last_direction.x, Some(AxisDirection::Positive));
        assert_eq!(state.last_direction.y, Some(AxisDirection::Negative));
        assert_eq!(state.last_direction.z, None);

        assert!(log.lock().contains(&"MA 100 -20 0".to_string()));
    }

    #[tokio::test]
    async fn relative_moves_record_direction() {
        let (port, log) = board(firmware(0));
        let stage = SerialStage::with_test_port(port);

        stage
            .move_relative(StageDirection::Left, 25, true, false)
            .await
            .unwrap();

        assert_eq!(stage.last_direction().x, Some(AxisDirection::Negative));
        assert_eq!(stage.read_position().await.unwrap().x, -25);
        assert_eq!(log.lock()[0], "MR L 25 1 0");
    }

    #[tokio::test]
    async fn preset_move_forgets_directions_of_moved_axes() {
        let (port, log) = board(firmware(0));
        let stage = SerialStage::with_test_port(port);

        stage.move_to(StagePosition::new(100, 50, 0)).await.unwrap();
        stage
            .move_relative(StageDirection::FocusDown, 10, true, false)
            .await
            .unwrap();
        stage.move_to_named(NamedPosition::Loading).await.unwrap();

        let directions = stage.last_direction();
        assert_eq!(directions.x, None);
        assert_eq!(directions.y, None);
        assert_eq!(directions.z, Some(AxisDirection::Negative));

        stage.move_to_named(NamedPosition::ZHome).await.unwrap();
        assert_eq!(stage.last_direction(), AxisDirections::default());
        assert!(log.lock().contains(&format!(
            "NP {}",
            protocol::preset_code(NamedPosition::Loading)
        )));
    }

    #[tokio::test]
    async fn motion_wait_polls_until_idle() {
        let (port, log) = board(firmware(3));
        let stage = SerialStage::with_test_port(port);

        stage.move_to(StagePosition::new(0, 50, 0)).await.unwrap();
        stage.wait_for_motion_complete(Duration::from_secs(2)).await.unwrap();

        let polls = log.lock().iter().filter(|c| *c == "MS?").count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn motion_wait_times_out_while_moving() {
        let (port, _log) = board(|command| {
            Some(if command == "MS?" { "1" } else { "OK" }.to_string())
        });
        let stage = SerialStage::with_test_port(port);

        let err = stage
            .wait_for_motion_complete(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(stage.is_connected().await);
    }

    #[tokio::test]
    async fn limit_error_keeps_direction_unchanged() {
        let (port, _log) = board(|command| {
            Some(if command.starts_with("MA") {
                "ERR LIMIT y".to_string()
            } else {
                "0 0 0".to_string()
            })
        });
        let stage = SerialStage::with_test_port(port);

        let err = stage.move_to(StagePosition::new(0, 10, 0)).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Limit);
        assert_eq!(stage.last_direction(), AxisDirections::default());
    }

    #[tokio::test]
    async fn unanswered_query_is_retried_then_times_out() {
        let (port, log) = board(|_| None);
        let stage = SerialStage::with_test_port(port)
            .with_timeout(Duration::from_millis(30))
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                backoff_delay: Duration::from_millis(1),
            });

        let err = stage.read_position().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn closed_link_marks_stage_disconnected() {
        let (host, device) = tokio::io::duplex(64);
        drop(device);
        let stage = SerialStage::with_test_port(wrap_shared(Box::new(host)));

        let err = stage.disable_motors().await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(!stage.is_connected().await);

        let err = stage.read_position().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn connect_validates_identification() {
        let (host, device) = tokio::io::duplex(1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(device, firmware(0), log));
        let stage = SerialStage::connect(Box::new(host)).await.unwrap();
        assert_eq!(stage.request_status().await.unwrap().firmware_version, 3);

        let (host, device) = tokio::io::duplex(1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(device, |_| Some("ESP300 v2".to_string()), log));
        let err = SerialStage::connect(Box::new(host)).await.err().unwrap();
        assert_eq!(err.kind, DriverErrorKind::Initialization);
    }

    #[tokio::test]
    async fn board_commands_are_encoded() {
        let (port, log) = board(firmware(0));
        let stage = SerialStage::with_test_port(port);

        stage.set_step_interval(Duration::from_micros(800)).await.unwrap();
        stage.set_led(Led::Fluorescent, 255).await.unwrap();
        stage.move_to_named(NamedPosition::Loading).await.unwrap();
        stage.disable_motors().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["SI 800", "LED F 255", "NP LOADING", "MO"]
        );
    }
}
