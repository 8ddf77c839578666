//! Derived-image cache
//!
//! Three tiers, each entry time-stamped on every access:
//!
//! - **Buffered**: raw frame bytes by path, optionally owned by a camera
//! - **Transformed**: decoded and processed pixels, keyed by
//!   `sha256(path | transformation signature)`
//! - **Exported**: encoded bytes, keyed by
//!   `sha256(path | transformation signature | format)`
//!
//! Saving a new frame invalidates everything derived from what it replaces
//! before the new bytes are inserted, so a camera reusing a path never shows
//! a stale render. Entries idle for longer than the TTL are dropped by
//! [`ImageProcessor::clear`], deepest tier first.
//!
//! The state sits behind one mutex. Decoding and processing run outside it;
//! a result is only cached if its source buffer was not replaced meanwhile.

use crate::adjust::CalibrationFrames;
use crate::buffer::PixelBuffer;
use crate::config::ImagingConfig;
use crate::error::{ImagingError, ImagingResult};
use crate::export::{decode, encode_raster, write_archival, ExportFormat, ExportedImage, ImageMetadata};
use crate::transform::{apply, Transformation, DISABLED_SIGNATURE};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Content hash addressing a derived entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    fn derive(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Key of a transformed entry
    pub fn transformed(path: &str, transformation: Option<&Transformation>) -> Self {
        let signature = transformation
            .map(|t| t.signature())
            .unwrap_or_else(|| DISABLED_SIGNATURE.to_string());
        Self::derive(&[path, &signature])
    }

    /// Key of an exported entry
    pub fn exported(path: &str, transformation: Option<&Transformation>, format: ExportFormat) -> Self {
        let signature = transformation
            .map(|t| t.signature())
            .unwrap_or_else(|| DISABLED_SIGNATURE.to_string());
        Self::derive(&[path, &signature, format.extension()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw bytes held for a path
#[derive(Debug, Clone)]
pub struct BufferedItem {
    pub path: String,
    pub bytes: Arc<Vec<u8>>,
    pub camera: Option<String>,
    pub touched: i64,
}

/// Processed frame as returned to callers
#[derive(Debug, Clone)]
pub struct TransformedItem {
    pub key: CacheKey,
    pub path: String,
    pub image: Arc<PixelBuffer>,
    /// Transformation as applied, including written-back auto stretch values
    pub transformation: Option<Transformation>,
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    path: String,
    camera: Option<String>,
    /// Transformed entry an export was encoded from
    source: Option<CacheKey>,
    touched: i64,
}

impl<T> Entry<T> {
    fn is_derived_from(&self, path: &str, camera: Option<&str>) -> bool {
        self.path == path || (camera.is_some() && self.camera.as_deref() == camera)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    buffered: HashMap<String, BufferedItem>,
    transformed: HashMap<CacheKey, Entry<TransformedItem>>,
    exported: HashMap<CacheKey, Entry<ExportedImage>>,
}

/// Number of entries per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub buffered: usize,
    pub transformed: usize,
    pub exported: usize,
}

/// Three-tier cache of raw, processed and encoded frames
#[derive(Debug)]
pub struct ImageProcessor {
    state: Mutex<CacheState>,
    config: ImagingConfig,
    decodes: AtomicUsize,
}

pub type SharedImageProcessor = Arc<ImageProcessor>;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new(ImagingConfig::default())
    }
}

impl ImageProcessor {
    pub fn new(config: ImagingConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
            decodes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves maps that are still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ImagingConfig {
        &self.config
    }

    // =========================================================================
    // BUFFERED TIER
    // =========================================================================

    /// Store raw bytes for `path`, dropping everything derived from what
    /// they replace.
    ///
    /// Frames owned by a camera also invalidate every other render of that
    /// camera. Unowned frames invalidate by exact path only.
    pub fn save(&self, bytes: Vec<u8>, path: &str, camera: Option<&str>) {
        let mut state = self.lock();
        let (transformed, exported) = Self::invalidate(&mut state, path, camera);
        state.buffered.insert(
            path.to_string(),
            BufferedItem {
                path: path.to_string(),
                bytes: Arc::new(bytes),
                camera: camera.map(str::to_string),
                touched: now_millis(),
            },
        );
        tracing::debug!(
            "Buffered {} (camera: {:?}), invalidated {} transformed / {} exported",
            path, camera, transformed, exported
        );
    }

    /// Write the bytes to disk, then buffer them
    pub fn save_file(&self, bytes: Vec<u8>, path: &str, camera: Option<&str>) -> ImagingResult<()> {
        let target = Path::new(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, &bytes)?;
        self.save(bytes, path, camera);
        Ok(())
    }

    fn invalidate(state: &mut CacheState, path: &str, camera: Option<&str>) -> (usize, usize) {
        let uses_as_master = |t: &Option<Transformation>| {
            t.as_ref().is_some_and(|t| {
                let cal = &t.calibration;
                [&cal.dark, &cal.flat, &cal.bias]
                    .iter()
                    .any(|p| p.as_deref() == Some(path))
            })
        };

        let before_transformed = state.transformed.len();
        state.transformed.retain(|_, e| {
            !(e.is_derived_from(path, camera) || uses_as_master(&e.value.transformation))
        });

        // Exports go with the transformed entry they were encoded from
        let before_exported = state.exported.len();
        let transformed = &state.transformed;
        state.exported.retain(|_, e| {
            !e.is_derived_from(path, camera)
                && e.source.as_ref().is_some_and(|k| transformed.contains_key(k))
        });

        (
            before_transformed - state.transformed.len(),
            before_exported - state.exported.len(),
        )
    }

    /// Raw bytes for `path`, if buffered
    pub fn get(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.lock().buffered.get(path).map(|item| item.bytes.clone())
    }

    /// The whole buffered item for `path`
    pub fn store(&self, path: &str) -> Option<BufferedItem> {
        self.lock().buffered.get(path).cloned()
    }

    // =========================================================================
    // TRANSFORMED TIER
    // =========================================================================

    /// Processed frame for `path`, from cache or freshly derived.
    ///
    /// `None` as transformation returns the decoded frame untouched. With auto
    /// stretch the computed parameters are written into `transformation`.
    /// Returns `None` when the frame cannot be found or decoded.
    pub fn transform(
        &self,
        path: &str,
        transformation: Option<&mut Transformation>,
        camera: Option<&str>,
    ) -> Option<TransformedItem> {
        let key = CacheKey::transformed(path, transformation.as_deref());

        let source = {
            let mut state = self.lock();
            if let Some(entry) = state.transformed.get_mut(&key) {
                entry.touched = now_millis();
                let item = entry.value.clone();
                if let (Some(target), Some(applied)) = (transformation, &item.transformation) {
                    target.stretch = applied.stretch;
                }
                return Some(item);
            }
            state.buffered.get(path).map(|b| (b.bytes.clone(), b.camera.clone()))
        };

        self.decodes.fetch_add(1, Ordering::Relaxed);
        let decoded = match &source {
            Some((bytes, _)) => decode(bytes),
            None => std::fs::read(path)
                .map_err(ImagingError::from)
                .and_then(|bytes| decode(&bytes)),
        };
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!("Nothing to show for {}: {}", path, e);
                return None;
            }
        };

        let (image, applied) = match transformation {
            Some(t) => {
                let masters = self.load_masters(t);
                let frames = CalibrationFrames {
                    dark: masters[0].as_ref().map(|m| m.image.as_ref()),
                    flat: masters[1].as_ref().map(|m| m.image.as_ref()),
                    bias: masters[2].as_ref().map(|m| m.image.as_ref()),
                };
                let processed = apply(image, t, &frames);
                (processed, Some(t.clone()))
            }
            None => (image, None),
        };

        let item = TransformedItem {
            key: key.clone(),
            path: path.to_string(),
            image: Arc::new(image),
            transformation: applied,
        };

        let mut state = self.lock();
        let current = state.buffered.get(path).map(|b| b.bytes.clone());
        let unchanged = match (&source, &current) {
            (Some((decoded_from, _)), Some(now)) => Arc::ptr_eq(decoded_from, now),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            let owner = camera
                .map(str::to_string)
                .or_else(|| source.as_ref().and_then(|(_, c)| c.clone()));
            state.transformed.insert(
                key,
                Entry {
                    value: item.clone(),
                    path: path.to_string(),
                    camera: owner,
                    source: None,
                    touched: now_millis(),
                },
            );
        } else {
            tracing::debug!("{} was replaced while processing, result not cached", path);
        }

        Some(item)
    }

    fn load_masters(&self, transformation: &Transformation) -> [Option<TransformedItem>; 3] {
        let cal = &transformation.calibration;
        [&cal.dark, &cal.flat, &cal.bias].map(|master| {
            let path = master.as_deref()?;
            let mut prepare = transformation.for_calibration_frame();
            let item = self.transform(path, Some(&mut prepare), None);
            if item.is_none() {
                tracing::warn!("Calibration frame {} could not be loaded", path);
            }
            item
        })
    }

    /// How many times a frame was decoded, cache misses included
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    // =========================================================================
    // EXPORTED TIER
    // =========================================================================

    /// Encode the processed frame.
    ///
    /// Raster exports without `save_at` are cached. With `save_at` the export
    /// is always derived again and written to that path. FITS and XISF can
    /// only be written to disk.
    pub fn export(
        &self,
        path: &str,
        transformation: Option<&mut Transformation>,
        format: ExportFormat,
        camera: Option<&str>,
        save_at: Option<&Path>,
    ) -> ImagingResult<Option<ExportedImage>> {
        if format.requires_destination() && save_at.is_none() {
            return Err(ImagingError::SaveLocationRequired {
                format: format.to_string(),
            });
        }

        let key = CacheKey::exported(path, transformation.as_deref(), format);
        if save_at.is_none() {
            let mut state = self.lock();
            if let Some(entry) = state.exported.get_mut(&key) {
                entry.touched = now_millis();
                let exported = entry.value.clone();
                if let (Some(target), Some(applied)) = (transformation, &exported.transformation) {
                    target.stretch = applied.stretch;
                }
                return Ok(Some(exported));
            }
        }

        let Some(item) = self.transform(path, transformation, camera) else {
            return Ok(None);
        };
        let metadata = ImageMetadata::from_buffer(&item.image);

        if let Some(destination) = save_at {
            if format.requires_destination() {
                let written = write_archival(&item.image, format, destination)?;
                tracing::info!("Exported {} as {} to {} ({} bytes)", path, format, destination.display(), written);
                return Ok(Some(ExportedImage {
                    format,
                    bytes: None,
                    metadata,
                    transformation: item.transformation.clone(),
                }));
            }
            let bytes = encode_raster(&item.image, format, self.config.jpeg_quality)?;
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(destination, &bytes)?;
            tracing::info!("Exported {} as {} to {}", path, format, destination.display());
            return Ok(Some(ExportedImage {
                format,
                bytes: Some(bytes),
                metadata,
                transformation: item.transformation.clone(),
            }));
        }

        let exported = ExportedImage {
            format,
            bytes: Some(encode_raster(&item.image, format, self.config.jpeg_quality)?),
            metadata,
            transformation: item.transformation.clone(),
        };

        let mut state = self.lock();
        // Skip caching if the transformed source was invalidated meanwhile
        if state.transformed.contains_key(&item.key) {
            let owner = state.transformed.get(&item.key).and_then(|e| e.camera.clone());
            state.exported.insert(
                key,
                Entry {
                    value: exported.clone(),
                    path: path.to_string(),
                    camera: owner,
                    source: Some(item.key.clone()),
                    touched: now_millis(),
                },
            );
        }

        Ok(Some(exported))
    }

    // =========================================================================
    // LIFETIME
    // =========================================================================

    /// Refresh entries in every tier.
    ///
    /// With a hash only that derived entry (and the buffered frame of its
    /// path) is touched, otherwise everything for `path`, plus everything of
    /// `camera` when given. A timestamp of `0` expires the matches at once.
    /// Returns the number of entries touched.
    pub fn ping(&self, path: &str, hash: Option<&CacheKey>, camera: Option<&str>, now: Option<i64>) -> usize {
        let stamp = now.unwrap_or_else(now_millis);
        let mut touched = 0;
        {
            let mut state = self.lock();
            let matches = |key: &CacheKey, entry_path: &str, entry_camera: Option<&str>| match hash {
                Some(h) => h == key,
                None => entry_path == path || (camera.is_some() && entry_camera == camera),
            };

            for (key, entry) in state.exported.iter_mut() {
                if matches(key, &entry.path, entry.camera.as_deref()) {
                    entry.touched = stamp;
                    touched += 1;
                }
            }
            for (key, entry) in state.transformed.iter_mut() {
                if matches(key, &entry.path, entry.camera.as_deref()) {
                    entry.touched = stamp;
                    touched += 1;
                }
            }
            for item in state.buffered.values_mut() {
                if item.path == path || (hash.is_none() && camera.is_some() && item.camera.as_deref() == camera) {
                    item.touched = stamp;
                    touched += 1;
                }
            }
        }

        if stamp == 0 {
            self.clear();
        }
        touched
    }

    /// Evict idle entries
    pub fn clear(&self) -> CacheStats {
        self.clear_at(now_millis())
    }

    /// Evict entries idle for longer than the TTL as of `now`, exported first.
    /// Returns how many were evicted per tier.
    pub fn clear_at(&self, now: i64) -> CacheStats {
        let ttl = self.config.cache_ttl_ms as i64;
        let stale = |touched: i64| now - touched > ttl;

        let mut state = self.lock();
        let before = Self::stats_of(&state);
        state.exported.retain(|_, e| !stale(e.touched));
        state.transformed.retain(|_, e| !stale(e.touched));
        state.buffered.retain(|_, item| !stale(item.touched));
        let after = Self::stats_of(&state);

        let evicted = CacheStats {
            buffered: before.buffered - after.buffered,
            transformed: before.transformed - after.transformed,
            exported: before.exported - after.exported,
        };
        if evicted != CacheStats::default() {
            tracing::debug!("Cache sweep evicted {:?}", evicted);
        }
        evicted
    }

    fn stats_of(state: &CacheState) -> CacheStats {
        CacheStats {
            buffered: state.buffered.len(),
            transformed: state.transformed.len(),
            exported: state.exported.len(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        Self::stats_of(&self.lock())
    }
}
