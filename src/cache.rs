use crate::heapdump::ProtoImage;
use crate::provider::DumpImage;
use anyhow::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub type SharedImage = Arc<dyn DumpImage + Send + Sync>;
pub type ImageLoader = Box<dyn Fn(&Path) -> Result<SharedImage> + Send>;
pub type SharedCache = Arc<Mutex<ImageCache>>;

/// Parsed dump images keyed by file, so that building, rebuilding and
/// reopening the same dump parse it only once.
pub struct ImageCache {
    images: LruCache<PathBuf, SharedImage>,
    loader: ImageLoader,
}

impl ImageCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_loader(
            capacity,
            Box::new(|p: &Path| Ok(Arc::new(ProtoImage::open(p)?) as SharedImage)),
        )
    }

    pub fn with_loader(capacity: usize, loader: ImageLoader) -> Self {
        ImageCache {
            images: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            loader,
        }
    }

    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    /// Returns the cached image for `path`, loading it on a miss
    pub fn get(&mut self, path: &Path) -> Result<SharedImage> {
        if let Some(image) = self.images.get(path) {
            debug!("Image cache hit for {}", path.display());
            return Ok(image.clone());
        }
        let image = self.get_uncached(path)?;
        self.images.put(path.to_path_buf(), image.clone());
        Ok(image)
    }

    pub fn get_uncached(&mut self, path: &Path) -> Result<SharedImage> {
        match (self.loader)(path) {
            Ok(image) => Ok(image),
            Err(e) => {
                if is_out_of_space(&e) {
                    warn!(
                        "Out of disk space loading {}, dropping {} cached images",
                        path.display(),
                        self.images.len()
                    );
                    self.clear_all();
                }
                Err(e)
            }
        }
    }

    pub fn clear(&mut self, path: &Path) {
        if self.images.pop(path).is_some() {
            debug!("Dropped cached image for {}", path.display());
        }
    }

    pub fn clear_all(&mut self) {
        self.images.clear();
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn is_out_of_space(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|c| c.downcast_ref::<std::io::Error>())
        .any(|io| io.raw_os_error() == Some(libc::ENOSPC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heapdump::HeapDump;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(capacity: usize, loads: Arc<AtomicUsize>) -> ImageCache {
        ImageCache::with_loader(
            capacity,
            Box::new(move |p: &Path| {
                if p.ends_with("full") {
                    return Err(std::io::Error::from_raw_os_error(libc::ENOSPC).into());
                }
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(ProtoImage::from(HeapDump::default())) as SharedImage)
            }),
        )
    }

    #[test]
    fn test_cache_hit_and_clear() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut cache = counting_cache(2, loads.clone());
        cache.get(Path::new("a")).unwrap();
        cache.get(Path::new("a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        cache.clear(Path::new("a"));
        cache.get(Path::new("a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_eviction() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut cache = counting_cache(2, loads.clone());
        cache.get(Path::new("a")).unwrap();
        cache.get(Path::new("b")).unwrap();
        cache.get(Path::new("c")).unwrap();
        assert_eq!(cache.len(), 2);
        cache.get(Path::new("a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_out_of_space_clears_cache() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut cache = counting_cache(4, loads);
        cache.get(Path::new("a")).unwrap();
        assert!(cache.get(Path::new("full")).is_err());
        assert!(cache.is_empty());
    }
}
