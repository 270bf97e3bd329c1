use crate::config::Config;
use crate::orientation::read_orientation;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, Semaphore};
use tokio::task;
use tracing::{debug, warn};

const JPEG_QUALITY: u8 = 90;
/// Renditions above this many pixels are refused and the original is served.
const MAX_RENDITION_PIXELS: u64 = 40_000_000;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Target box for a rendition; `0` on one axis follows the other axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RenditionSpec {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub path: PathBuf,
    /// False when the original file is served because scaling failed.
    pub rendered: bool,
}

/// On-disk cache of oriented, scaled JPEG renditions.
///
/// Entries are named `sha256(source path)-WxH` and are never evicted or
/// revalidated against the source.
#[derive(Clone)]
pub struct RenditionCache {
    dir: PathBuf,
    singleflight: RenderSingleflight,
    render_semaphore: Arc<Semaphore>,
    wait_timeout: Duration,
}

impl RenditionCache {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_limits(
            config.cache_dir.clone(),
            config.max_concurrent_renditions,
            config.rendition_wait,
        )
    }

    pub fn with_limits(dir: PathBuf, max_concurrent: usize, wait_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create cache directory {}", dir.display()))?;
        Ok(Self {
            dir,
            singleflight: RenderSingleflight::new(),
            render_semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            wait_timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    pub fn entry_path(&self, source: &Path, spec: RenditionSpec) -> PathBuf {
        self.dir.join(cache_key(source, spec))
    }

    /// Returns the cached rendition, creating it on a miss. Never fails:
    /// when the source cannot be rendered its own path comes back instead.
    pub async fn get_or_create(&self, source: &Path, spec: RenditionSpec) -> Rendition {
        let key = cache_key(source, spec);
        let target = self.dir.join(&key);
        if is_file(&target).await {
            return Rendition::cached(target);
        }

        let permit = self.singleflight.acquire(&key).await;
        if !permit.is_leader() {
            let completed = permit.wait_result(self.wait_timeout).await;
            if is_file(&target).await {
                return Rendition::cached(target);
            }
            if !completed {
                debug!(key = %key, "rendition wait timed out");
            }
            return self.render_or_fallback(source, spec, target, &key).await;
        }
        if is_file(&target).await {
            return Rendition::cached(target);
        }
        let rendition = self.render_or_fallback(source, spec, target, &key).await;
        drop(permit);
        rendition
    }

    async fn render_or_fallback(
        &self,
        source: &Path,
        spec: RenditionSpec,
        target: PathBuf,
        key: &str,
    ) -> Rendition {
        match self.render(source, spec, &target).await {
            Ok(()) => {
                debug!(key = %key, source = %source.display(), "rendition stored");
                Rendition::cached(target)
            }
            Err(err) => {
                warn!(
                    error = ?err,
                    key = %key,
                    source = %source.display(),
                    "rendition failed, serving original"
                );
                Rendition {
                    path: source.to_path_buf(),
                    rendered: false,
                }
            }
        }
    }

    async fn render(&self, source: &Path, spec: RenditionSpec, target: &Path) -> Result<()> {
        let _permit = self.render_semaphore.acquire().await?;
        let source = source.to_path_buf();
        let bytes = task::spawn_blocking(move || render_jpeg(&source, spec))
            .await
            .context("rendition task")??;
        store_file(target, &bytes).await
    }
}

impl Rendition {
    fn cached(path: PathBuf) -> Self {
        Self {
            path,
            rendered: true,
        }
    }
}

pub fn cache_key(source: &Path, spec: RenditionSpec) -> String {
    format!(
        "{}-{}x{}",
        sha256_hex(&source.to_string_lossy()),
        spec.width,
        spec.height
    )
}

/// Output size for a source of `width` x `height`. With both axes set the
/// image is fitted inside the box.
pub fn target_dimensions(width: u32, height: u32, spec: RenditionSpec) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let (w, h) = (width as f64, height as f64);
    let scaled = match (spec.width, spec.height) {
        (0, 0) => return (width, height),
        (target_w, 0) => (target_w as f64, h * target_w as f64 / w),
        (0, target_h) => (w * target_h as f64 / h, target_h as f64),
        (target_w, target_h) => {
            let ratio = (target_w as f64 / w).min(target_h as f64 / h);
            (w * ratio, h * ratio)
        }
    };
    (
        (scaled.0.round() as u32).max(1),
        (scaled.1.round() as u32).max(1),
    )
}

fn render_jpeg(source: &Path, spec: RenditionSpec) -> Result<Vec<u8>> {
    let orientation = read_orientation(source)?;
    let image = ImageReader::open(source)?
        .with_guessed_format()?
        .decode()?;
    let image = orientation.apply(image);
    let image = scale(image, spec)?;
    encode_jpeg(&image)
}

fn scale(image: DynamicImage, spec: RenditionSpec) -> Result<DynamicImage> {
    let (width, height) = target_dimensions(image.width(), image.height(), spec);
    if (width, height) == (image.width(), image.height()) {
        return Ok(image);
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > MAX_RENDITION_PIXELS {
        return Err(anyhow!(
            "rendition {width}x{height} exceeds {MAX_RENDITION_PIXELS} pixels"
        ));
    }
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder.encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ColorType::Rgb8.into(),
    )?;
    Ok(bytes)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Writes through a sibling temp file and renames it into place, so readers
/// see either nothing or the whole file.
async fn store_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("cache entry {} has no parent", path.display()))?;
    tokio::fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("rendition");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let sequence = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}-{sequence}"));
    if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct RenderSingleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl RenderSingleflight {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) -> SingleflightPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => SingleflightPermit {
                key: key.to_string(),
                notify: entry.get().clone(),
                is_leader: false,
                inner: self.inner.clone(),
            },
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                SingleflightPermit {
                    key: key.to_string(),
                    notify,
                    is_leader: true,
                    inner: self.inner.clone(),
                }
            }
        }
    }
}

pub struct SingleflightPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl SingleflightPermit {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Waits for the leader to drop its permit. Returns false on timeout.
    pub async fn wait_result(self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.leader_still_running() {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    fn leader_still_running(&self) -> bool {
        self.inner
            .get(&self.key)
            .map(|current| Arc::ptr_eq(current.value(), &self.notify))
            .unwrap_or(false)
    }
}

impl Drop for SingleflightPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::fixtures::write_oriented_jpeg;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        RgbImage::from_fn(width, height, |x, _| Rgb([(x * 5) as u8, 120, 40]))
            .save(path)
            .unwrap();
    }

    fn cache_in(dir: &Path) -> RenditionCache {
        RenditionCache::with_limits(dir.join("cache"), 2, Duration::from_secs(5)).unwrap()
    }

    const THUMB: RenditionSpec = RenditionSpec {
        width: 100,
        height: 100,
    };

    #[test]
    fn key_is_path_hash_plus_dimensions() {
        let key = cache_key(Path::new("/lib/IMG_01.jpg"), THUMB);
        let (hash, dims) = key.split_once('-').unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(dims, "100x100");
        assert_eq!(key, cache_key(Path::new("/lib/IMG_01.jpg"), THUMB));
        assert_ne!(key, cache_key(Path::new("/lib/IMG_02.jpg"), THUMB));
    }

    #[test]
    fn dimensions_follow_the_spec() {
        let spec = |width, height| RenditionSpec { width, height };
        assert_eq!(target_dimensions(4000, 3000, spec(1024, 0)), (1024, 768));
        assert_eq!(target_dimensions(4000, 3000, spec(0, 300)), (400, 300));
        assert_eq!(target_dimensions(4000, 3000, spec(100, 100)), (100, 75));
        assert_eq!(target_dimensions(3000, 4000, spec(100, 100)), (75, 100));
        assert_eq!(target_dimensions(4000, 3000, spec(0, 0)), (4000, 3000));
        assert_eq!(target_dimensions(5000, 1, spec(100, 0)), (100, 1));
    }

    #[tokio::test]
    async fn second_call_reuses_the_entry() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("IMG_01.jpg");
        write_jpeg(&source, 40, 20);
        let cache = cache_in(dir.path());

        let first = cache.get_or_create(&source, THUMB).await;
        assert!(first.rendered);
        assert_eq!(first.path, cache.entry_path(&source, THUMB));
        let modified = std::fs::metadata(&first.path).unwrap().modified().unwrap();

        let second = cache.get_or_create(&source, THUMB).await;
        assert_eq!(second, first);
        let modified_again = std::fs::metadata(&second.path).unwrap().modified().unwrap();
        assert_eq!(modified, modified_again);

        let entries: Vec<_> = std::fs::read_dir(cache.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn rendition_is_a_scaled_upright_jpeg() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("wide.jpg");
        write_jpeg(&source, 40, 20);
        let cache = cache_in(dir.path());

        let thumb = cache.get_or_create(&source, THUMB).await;
        let bytes = std::fs::read(&thumb.path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));

        let inline = cache
            .get_or_create(
                &source,
                RenditionSpec {
                    width: 1024,
                    height: 0,
                },
            )
            .await;
        let decoded = image::load_from_memory(&std::fs::read(&inline.path).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 512));
    }

    #[tokio::test]
    async fn broken_source_falls_back_to_original() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("broken.jpg");
        std::fs::write(&source, b"definitely not a jpeg").unwrap();
        let cache = cache_in(dir.path());

        let rendition = cache.get_or_create(&source, THUMB).await;
        assert_eq!(rendition.path, source);
        assert!(!rendition.rendered);
        assert!(!cache.entry_path(&source, THUMB).exists());
    }

    #[tokio::test]
    async fn exif_rotation_is_applied_before_scaling() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("sideways.jpg");
        write_oriented_jpeg(&source, 40, 20, 6);
        let cache = cache_in(dir.path());

        let thumb = cache.get_or_create(&source, THUMB).await;
        assert!(thumb.rendered);
        let decoded = image::load_from_memory(&std::fs::read(&thumb.path).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (50, 100));
    }

    #[test]
    fn oversized_targets_are_refused() {
        let strip = DynamicImage::ImageRgb8(RgbImage::new(1, 100));
        let spec = RenditionSpec {
            width: 1024,
            height: 0,
        };
        assert_eq!(target_dimensions(1, 100, spec), (1024, 102_400));
        assert!(scale(strip, spec).is_err());
    }

    #[tokio::test]
    async fn oversized_rendition_falls_back_to_original() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("strip.jpg");
        write_jpeg(&source, 1, 100);
        let cache = cache_in(dir.path());
        let spec = RenditionSpec {
            width: 1024,
            height: 0,
        };

        let rendition = cache.get_or_create(&source, spec).await;
        assert_eq!(rendition.path, source);
        assert!(!rendition.rendered);
        assert!(!cache.entry_path(&source, spec).exists());
    }

    #[tokio::test]
    async fn missing_source_falls_back_to_original() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("gone.jpg");
        let cache = cache_in(dir.path());
        let rendition = cache.get_or_create(&source, THUMB).await;
        assert_eq!(rendition.path, source);
        assert!(!rendition.rendered);
    }

    #[tokio::test]
    async fn concurrent_misses_converge() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("IMG_07.jpg");
        write_jpeg(&source, 64, 48);
        let cache = cache_in(dir.path());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_create(&source, THUMB).await
            }));
        }
        let expected = cache.entry_path(&source, THUMB);
        for handle in handles {
            let rendition = handle.await.unwrap();
            assert_eq!(rendition.path, expected);
            assert!(rendition.rendered);
        }
        let entries: Vec<_> = std::fs::read_dir(cache.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn singleflight_elects_one_leader() {
        let flight = RenderSingleflight::new();
        let leader = flight.acquire("k").await;
        let waiter = flight.acquire("k").await;
        assert!(leader.is_leader());
        assert!(!waiter.is_leader());
        drop(leader);
        assert!(waiter.wait_result(Duration::from_millis(50)).await);
        assert!(flight.acquire("k").await.is_leader());
    }

    #[tokio::test]
    async fn singleflight_wait_times_out() {
        let flight = RenderSingleflight::new();
        let _leader = flight.acquire("k").await;
        let waiter = flight.acquire("k").await;
        assert!(!waiter.wait_result(Duration::from_millis(20)).await);
    }
}
