//! Image sinks.
//!
//! The orchestrator hands every captured frame to an [`ImageSink`] and keeps
//! only the returned [`ImageHandle`]. The sink owns the pixels from then on.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use image::codecs::tiff::TiffEncoder;
use image::{ExtendedColorType, GrayImage, ImageBuffer, Luma};
use parking_lot::Mutex;
use scope_core::data::{Frame, ImageHandle};
use tracing::debug;

use crate::grid::GridPosition;

/// Capture-pipeline collaborator that takes ownership of frames.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Store `frame` taken at `position`.
    async fn store(&self, position: &GridPosition, frame: Frame) -> anyhow::Result<ImageHandle>;
}

/// A frame held by [`MemoryImageSink`].
#[derive(Debug, Clone)]
pub struct StoredImage {
    /// Handle returned to the orchestrator
    pub handle: ImageHandle,
    /// Where it was taken
    pub position: GridPosition,
    /// Pixels
    pub frame: Frame,
}

/// Keeps frames in memory. Used by the simulator and tests.
#[derive(Debug, Default)]
pub struct MemoryImageSink {
    images: Mutex<Vec<StoredImage>>,
}

impl MemoryImageSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored frames.
    pub fn len(&self) -> usize {
        self.images.lock().len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.images.lock().is_empty()
    }

    /// Snapshot of everything stored, in arrival order.
    pub fn images(&self) -> Vec<StoredImage> {
        self.images.lock().clone()
    }

    /// Frame for `handle`.
    pub fn get(&self, handle: ImageHandle) -> Option<Frame> {
        self.images
            .lock()
            .iter()
            .find(|img| img.handle == handle)
            .map(|img| img.frame.clone())
    }
}

#[async_trait]
impl ImageSink for MemoryImageSink {
    async fn store(&self, position: &GridPosition, frame: Frame) -> anyhow::Result<ImageHandle> {
        let handle = ImageHandle::new();
        self.images.lock().push(StoredImage {
            handle,
            position: *position,
            frame,
        });
        Ok(handle)
    }
}

/// Writes each frame as a grayscale TIFF file named after its grid cell.
#[derive(Debug, Clone)]
pub struct DirectoryImageSink {
    root: PathBuf,
}

impl DirectoryImageSink {
    /// Sink writing into `root`. The directory is created on first store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path used for a field.
    pub fn path_for(&self, position: &GridPosition) -> PathBuf {
        self.root
            .join(format!("field_r{:03}_c{:03}.tiff", position.row, position.column))
    }
}

/// Encode a frame as a grayscale TIFF, keeping its bit depth (8 or 16).
pub fn encode_tiff(frame: &Frame) -> anyhow::Result<Vec<u8>> {
    frame.size()?;
    let (width, height) = (frame.width, frame.height);
    let mut out = Cursor::new(Vec::new());
    let encoder = TiffEncoder::new(&mut out);

    if frame.bit_depth <= 8 {
        let img: GrayImage = ImageBuffer::from_raw(width, height, frame.data.clone())
            .ok_or_else(|| anyhow!("failed to create image buffer from frame data"))?;
        encoder
            .encode(&img, width, height, ExtendedColorType::L8)
            .context("failed to encode 8-bit TIFF")?;
    } else {
        let samples: Vec<u16> = frame
            .data
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_raw(width, height, samples)
            .ok_or_else(|| anyhow!("failed to create 16-bit image buffer from frame data"))?;
        // The encoder takes 16-bit samples as native-endian bytes.
        let bytes: Vec<u8> = img.as_raw().iter().flat_map(|v| v.to_ne_bytes()).collect();
        encoder
            .encode(&bytes, width, height, ExtendedColorType::L16)
            .context("failed to encode 16-bit TIFF")?;
    }
    Ok(out.into_inner())
}

#[async_trait]
impl ImageSink for DirectoryImageSink {
    async fn store(&self, position: &GridPosition, frame: Frame) -> anyhow::Result<ImageHandle> {
        let bytes = tokio::task::spawn_blocking(move || encode_tiff(&frame)).await??;
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(position);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), row = position.row, col = position.column, "frame written");
        Ok(ImageHandle::new())
    }
}
