use std::{path::PathBuf, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{CropcastResult, IoError};

/// TTL-gated fetch cache: `{cache_dir}/{md5_of_args}.json`, age taken from the
/// file's mtime.
#[derive(Debug, Clone)]
pub struct FetchCache {
    dir: PathBuf,
}

impl FetchCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Cache key: md5 over the joined argument parts.
    pub fn key(parts: &[String]) -> String {
        format!("{:x}", md5::compute(parts.join("|").as_bytes()))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load a cached value if the file exists and is younger than `ttl_secs`.
    pub fn load<T: DeserializeOwned>(&self, key: &str, ttl_secs: u64) -> Option<T> {
        let path = self.path(key);
        let metadata = std::fs::metadata(&path).ok()?;
        let age = metadata.modified().ok()?.elapsed().ok()?;
        if age > Duration::from_secs(ttl_secs) {
            return None;
        }
        let text = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> CropcastResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(IoError::Io)?;
        let text = serde_json::to_string(value).map_err(IoError::Json)?;
        std::fs::write(self.path(key), text).map_err(IoError::Io)?;
        Ok(())
    }

    /// Path for a cached weekly lineup PDF:
    /// `{cache_dir}/anec_pdfs/anec_exports_w{WW}_{YYYY}.pdf`.
    pub fn lineup_pdf_path(&self, iso_week: u32, year: i32) -> PathBuf {
        self.dir
            .join("anec_pdfs")
            .join(format!("anec_exports_w{iso_week:02}_{year}.pdf"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_md5_hex() {
        let key = FetchCache::key(&["comex".to_string(), "2024-08".to_string()]);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls, sensitive to content.
        assert_eq!(key, FetchCache::key(&["comex".to_string(), "2024-08".to_string()]));
        assert_ne!(key, FetchCache::key(&["comex".to_string(), "2024-09".to_string()]));
    }

    #[test]
    fn round_trip_and_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FetchCache::new(dir.path().to_path_buf());

        cache.store("abc", &serde_json::json!({"n": 1})).unwrap();
        let hit: Option<serde_json::Value> = cache.load("abc", 3600);
        assert_eq!(hit.unwrap()["n"], 1);

        // Zero TTL: anything already written is stale.
        let miss: Option<serde_json::Value> = cache.load("abc", 0);
        assert!(miss.is_none());
    }

    #[test]
    fn lineup_pdf_path_shape() {
        let cache = FetchCache::new(PathBuf::from("/tmp/cache"));
        let path = cache.lineup_pdf_path(7, 2025);
        assert!(path.ends_with("anec_pdfs/anec_exports_w07_2025.pdf"));
    }
}
