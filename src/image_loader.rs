//! Image decoding off the render thread, plus data-URL helpers used by
//! snapshots.

use std::io::Cursor;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::{ImageFormat, RgbaImage};

use crate::node::NodeId;

/// Decode PNG/JPEG bytes into RGBA8.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage> {
    let img = image::load_from_memory(bytes).context("failed to decode image bytes")?;
    Ok(img.to_rgba8())
}

/// Image types a snapshot may embed, keyed by data-URL mime type.
fn embedded_format(mime: &str) -> Option<ImageFormat> {
    match mime.to_ascii_lowercase().as_str() {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}

/// Payload of a `%XX`-escaped data URL. Both escape digits must be hex.
fn percent_decode(payload: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len());
    let mut bytes = payload.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            bail!("truncated percent escape in image data URL");
        };
        match ((hi as char).to_digit(16), (lo as char).to_digit(16)) {
            (Some(h), Some(l)) => out.push((h * 16 + l) as u8),
            _ => bail!(
                "invalid percent escape '%{}{}' in image data URL",
                hi as char,
                lo as char
            ),
        }
    }
    Ok(out)
}

/// Decode an image embedded in a snapshot: `data:image/png;base64,...` or
/// `data:image/jpeg;base64,...`. The payload must be in the declared format.
pub fn decode_image_data_url(data_url: &str) -> Result<RgbaImage> {
    let (header, payload) = data_url
        .trim()
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| anyhow!("not an image data URL"))?;
    let mut params = header.split(';').map(str::trim);
    let mime = params.next().unwrap_or_default();
    let format = embedded_format(mime)
        .ok_or_else(|| anyhow!("unsupported image type '{mime}' in data URL"))?;

    let bytes = if params.any(|p| p.eq_ignore_ascii_case("base64")) {
        general_purpose::STANDARD
            .decode(payload.trim())
            .context("invalid base64 in image data URL")?
    } else {
        percent_decode(payload)?
    };
    let img = image::load_from_memory_with_format(&bytes, format)
        .with_context(|| format!("failed to decode {mime} data URL"))?;
    Ok(img.to_rgba8())
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(buf.into_inner())
}

pub fn encode_png_data_url(image: &RgbaImage) -> Result<String> {
    let png = encode_png(image)?;
    Ok(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png)
    ))
}

struct DecodeJob {
    node: NodeId,
    bytes: Vec<u8>,
}

/// Result of one queued decode. Errors are carried as text so the value can
/// cross threads and be logged or surfaced as-is.
#[derive(Debug)]
pub struct DecodedImage {
    pub node: NodeId,
    pub result: std::result::Result<RgbaImage, String>,
}

/// Background decoder: bytes go in with [`ImageLoader::queue`], decoded
/// images come out of [`ImageLoader::drain`] on the owning thread.
pub struct ImageLoader {
    jobs: Option<Sender<DecodeJob>>,
    done: Receiver<DecodedImage>,
    worker: Option<JoinHandle<()>>,
    pending: usize,
}

impl ImageLoader {
    pub fn spawn() -> Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<DecodeJob>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<DecodedImage>();
        let worker = std::thread::Builder::new()
            .name("image-decode".to_string())
            .spawn(move || {
                for job in job_rx.iter() {
                    let result = decode_image(&job.bytes).map_err(|e| format!("{e:#}"));
                    if done_tx
                        .send(DecodedImage {
                            node: job.node,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .context("failed to spawn image decode thread")?;
        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            worker: Some(worker),
            pending: 0,
        })
    }

    pub fn queue(&mut self, node: NodeId, bytes: Vec<u8>) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("image loader is shut down"))?;
        jobs.send(DecodeJob { node, bytes })
            .map_err(|_| anyhow!("image decode thread exited"))?;
        self.pending += 1;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Collect finished decodes. With `wait`, block until every queued job is
    /// done or the timeout elapses; without, return only what is ready.
    pub fn drain(&mut self, wait: Option<Duration>) -> Vec<DecodedImage> {
        let mut out = Vec::new();
        while let Ok(decoded) = self.done.try_recv() {
            out.push(decoded);
        }
        if let Some(timeout) = wait {
            let deadline = Instant::now() + timeout;
            while self.pending > out.len() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.done.recv_timeout(remaining) {
                    Ok(decoded) => out.push(decoded),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        self.pending = self.pending.saturating_sub(out.len());
        out
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
