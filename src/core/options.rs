use crate::core::constants::*;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};

/// Settings for opening a paged file, B-tree or record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Page size in bytes. Multiple of 8 between 256 and 32768.
    /// Default: 4096
    pub page_size: usize,
    /// Bytes reserved at the start of every page for its header.
    /// Default: 64
    pub page_header_size: usize,
    /// Number of pages held by the page cache.
    pub cache_size: usize,
    /// When > 0, leaf splits during ascending inserts are skewed towards the
    /// insertion point instead of the median. Default: 0.0 (disabled)
    pub split_factor: f64,
    /// Fixed key length for the B-tree, or -1 for variable length keys.
    pub fixed_key_len: i16,
    /// Journal mutations passed a transaction. Default: true
    pub recovery_enabled: bool,
    pub read_only: bool,
    pub file_permissions: u32,
    /// fsync the journal on every commit. Default: true
    pub sync_on_commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_header_size: DEFAULT_PAGE_HEADER_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            split_factor: 0.0,
            fixed_key_len: -1,
            recovery_enabled: true,
            read_only: false,
            file_permissions: 0o644,
            sync_on_commit: true,
        }
    }
}

impl StoreOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: StoreOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_split_factor(mut self, split_factor: f64) -> Self {
        self.split_factor = split_factor;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Usable bytes per page once the header is taken out.
    pub fn work_size(&self) -> usize {
        self.page_size - self.page_header_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size % 8 != 0
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::InvalidPageSize(self.page_size));
        }
        if self.page_header_size < DOM_PAGE_HEADER_LEN || self.page_header_size > u8::MAX as usize {
            return Err(Error::InvalidOptions(format!(
                "page_header_size {} must be between {} and {}",
                self.page_header_size,
                DOM_PAGE_HEADER_LEN,
                u8::MAX
            )));
        }
        if self.page_header_size >= self.page_size / 2 {
            return Err(Error::InvalidOptions(format!(
                "page_header_size {} leaves no room in a {} byte page",
                self.page_header_size, self.page_size
            )));
        }
        if !(0.0..1.0).contains(&self.split_factor) {
            return Err(Error::InvalidOptions(format!(
                "split_factor {} must be in [0, 1)",
                self.split_factor
            )));
        }
        if self.fixed_key_len == 0 || self.fixed_key_len < -1 {
            return Err(Error::InvalidOptions(format!(
                "fixed_key_len {} must be -1 or positive",
                self.fixed_key_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let opts = StoreOptions::default();
        opts.validate().unwrap();
        assert_eq!(opts.work_size(), 4096 - 64);
    }

    #[test]
    fn test_from_json_partial() {
        let opts = StoreOptions::from_json(r#"{ "page_size": 1024, "split_factor": 0.5 }"#).unwrap();
        assert_eq!(opts.page_size, 1024);
        assert_eq!(opts.split_factor, 0.5);
        assert_eq!(opts.page_header_size, DEFAULT_PAGE_HEADER_SIZE);
        assert!(opts.recovery_enabled);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let err = StoreOptions::default().with_page_size(1001).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidPageSize(1001)));

        let err = StoreOptions::from_json(r#"{ "page_size": 128 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidPageSize(128)));
    }

    #[test]
    fn test_json_roundtrip_keeps_fields() {
        let opts = StoreOptions::default().with_page_size(512).with_cache_size(16);
        let json = opts.to_json().unwrap();
        assert_eq!(StoreOptions::from_json(&json).unwrap(), opts);
    }
}
