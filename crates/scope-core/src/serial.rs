//! Async serial link helpers for stage-board drivers.
//!
//! Requires the `serial` feature. The driver works over any
//! `AsyncRead + AsyncWrite` transport, so tests can hand it one end of a
//! `tokio::io::duplex` pipe while production code opens a real port with
//! [`open_serial_async`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

use crate::error::{DriverError, DriverErrorKind, DriverResult};

/// Transport usable as a stage-board link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased transport.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Transport shared between tasks, buffered for line reads.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a transport for shared, line-buffered access.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port (8N1, no flow control) off the async runtime.
///
/// # Errors
///
/// `Initialization` when the port cannot be opened.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    driver_type: &str,
) -> DriverResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let driver = driver_type.to_string();

    let opened = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DriverError::new(
                    driver,
                    DriverErrorKind::Initialization,
                    format!("failed to open serial port {}: {}", path, e),
                )
            })
    })
    .await
    .map_err(|e| {
        DriverError::new(
            driver_type,
            DriverErrorKind::Initialization,
            format!("serial open task failed: {}", e),
        )
    })?;

    opened
}

/// Read and discard whatever is pending on the link, for at most `window`.
///
/// Returns the number of bytes dropped.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut scratch = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut dropped = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut scratch)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => dropped += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    dropped
}
