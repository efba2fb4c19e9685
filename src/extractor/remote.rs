use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;
use url::Url;

use crate::app_dirs;
use crate::config::ExtractorSettings;
use crate::http_client;

use super::{BurnExtractor, ExtractorSource, FeatureExtractor, LoadError};

/// File name of the cached encoder weights inside the models directory.
pub const ENCODER_FILE_NAME: &str = "frame_encoder.bpk";

/// Fetches encoder weights over HTTPS once, then serves them from disk.
#[derive(Debug, Clone)]
pub struct RemoteExtractorSource {
    settings: ExtractorSettings,
    models_dir: PathBuf,
}

impl RemoteExtractorSource {
    /// Source that caches weights under the app's `models/` directory.
    pub fn new(settings: ExtractorSettings) -> Result<Self, LoadError> {
        let models_dir = app_dirs::models_dir().map_err(|err| LoadError::Init(err.to_string()))?;
        Ok(Self::with_models_dir(settings, models_dir))
    }

    pub fn with_models_dir(settings: ExtractorSettings, models_dir: PathBuf) -> Self {
        Self {
            settings,
            models_dir,
        }
    }

    pub fn weights_path(&self) -> PathBuf {
        self.models_dir.join(ENCODER_FILE_NAME)
    }

    /// Make sure verified weights are on disk, downloading them if needed.
    pub fn ensure_weights(&self, force: bool) -> Result<PathBuf, LoadError> {
        let path = self.weights_path();
        let expected = self
            .settings
            .sha256
            .as_deref()
            .map(normalize_sha256)
            .transpose()?;
        if path.exists() && !force {
            match expected.as_deref() {
                Some(expected) if sha256_file(&path)? != expected => {
                    info!("Cached encoder weights failed verification; downloading again");
                }
                _ => return Ok(path),
            }
        }
        let Some(url) = self.settings.url.as_deref() else {
            return Err(LoadError::Missing(path));
        };
        let allowed: HashSet<String> = self.settings.allowed_hosts.iter().cloned().collect();
        validate_url(url, &allowed)?;
        fs::create_dir_all(&self.models_dir)
            .map_err(|err| LoadError::Download(format!("{}: {err}", self.models_dir.display())))?;
        download_to_path(
            url,
            &path,
            expected.as_deref(),
            self.settings.max_download_bytes,
        )?;
        info!("Downloaded encoder weights to {}", path.display());
        Ok(path)
    }
}

impl ExtractorSource for RemoteExtractorSource {
    fn fetch(&self) -> Result<Arc<dyn FeatureExtractor>, LoadError> {
        let path = self.ensure_weights(false)?;
        let extractor = BurnExtractor::from_burnpack(&path, self.settings.input_size)?;
        Ok(Arc::new(extractor))
    }
}

fn validate_url(url: &str, allowed_hosts: &HashSet<String>) -> Result<(), LoadError> {
    let invalid = |reason: String| LoadError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|err| invalid(err.to_string()))?;
    if parsed.scheme() != "https" {
        return Err(invalid("must use https".into()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("missing host".into()))?;
    if !allowed_hosts.contains(&host.to_ascii_lowercase()) {
        return Err(invalid(format!("host '{host}' is not allowlisted")));
    }
    Ok(())
}

fn normalize_sha256(value: &str) -> Result<String, LoadError> {
    let trimmed = value.trim();
    if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LoadError::Init(format!(
            "Invalid SHA-256 value; expected 64 hex characters, got '{trimmed}'"
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}

fn download_to_path(
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
    max_bytes: u64,
) -> Result<(), LoadError> {
    let response = http_client::agent()
        .get(url)
        .call()
        .map_err(|err| LoadError::Download(format!("{url}: {err}")))?;
    let dir = dest
        .parent()
        .ok_or_else(|| LoadError::Download(format!("{} has no parent", dest.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| LoadError::Download(format!("temp file in {}: {err}", dir.display())))?;
    let max_bytes = usize::try_from(max_bytes).unwrap_or(usize::MAX);
    http_client::copy_response_to_writer(response, tmp.as_file_mut(), max_bytes)
        .map_err(|err| LoadError::Download(format!("{url}: {err}")))?;
    tmp.as_file_mut()
        .flush()
        .map_err(|err| LoadError::Download(format!("flush: {err}")))?;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_file(tmp.path())?;
        if actual != expected {
            return Err(LoadError::Checksum {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    tmp.persist(dest)
        .map_err(|err| LoadError::Download(format!("move to {}: {}", dest.display(), err.error)))?;
    Ok(())
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String, LoadError> {
    let read_err = |err: std::io::Error| LoadError::Init(format!("{}: {err}", path.display()));
    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(read_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hosts(values: &[&str]) -> HashSet<String> {
        values.iter().map(|host| host.to_string()).collect()
    }

    #[test]
    fn url_must_be_https() {
        let err = validate_url("http://example.com/enc.bpk", &hosts(&["example.com"])).unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn url_host_must_be_allowlisted() {
        let err =
            validate_url("https://untrusted.test/enc.bpk", &hosts(&["example.com"])).unwrap_err();
        assert!(err.to_string().contains("allowlisted"));
        assert!(validate_url("https://Example.com/enc.bpk", &hosts(&["example.com"])).is_ok());
    }

    #[test]
    fn sha256_requires_hex() {
        assert!(normalize_sha256("nope").is_err());
        let upper = "A".repeat(64);
        assert_eq!(normalize_sha256(&upper).unwrap(), "a".repeat(64));
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_url_without_cache_is_reported() {
        let dir = tempdir().unwrap();
        let source =
            RemoteExtractorSource::with_models_dir(ExtractorSettings::default(), dir.path().into());
        let err = source.ensure_weights(false).unwrap_err();
        assert_eq!(err, LoadError::Missing(dir.path().join(ENCODER_FILE_NAME)));
    }

    #[test]
    fn cached_weights_are_reused_without_network() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ENCODER_FILE_NAME), b"abc").unwrap();
        let settings = ExtractorSettings {
            url: Some("https://untrusted.test/enc.bpk".into()),
            sha256: Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into()),
            ..ExtractorSettings::default()
        };
        let source = RemoteExtractorSource::with_models_dir(settings, dir.path().into());
        assert_eq!(
            source.ensure_weights(false).unwrap(),
            dir.path().join(ENCODER_FILE_NAME)
        );
    }

    #[test]
    fn stale_cache_with_bad_url_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ENCODER_FILE_NAME), b"tampered").unwrap();
        let settings = ExtractorSettings {
            url: Some("http://huggingface.co/enc.bpk".into()),
            sha256: Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into()),
            ..ExtractorSettings::default()
        };
        let source = RemoteExtractorSource::with_models_dir(settings, dir.path().into());
        assert!(matches!(
            source.ensure_weights(false),
            Err(LoadError::InvalidUrl { .. })
        ));
    }
}
