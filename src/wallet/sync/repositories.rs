use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Errors raised while reading or writing persisted caches
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
	#[error("IO error on {path:?}: {source}")]
	IoError {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
}

impl PersistenceError {
	fn io(path: &Path, source: std::io::Error) -> Self {
		PersistenceError::IoError {
			path: path.to_path_buf(),
			source,
		}
	}
}

/// Repository for named JSON cache blobs
#[async_trait]
pub trait CacheRepository: Send + Sync {
	async fn save(&self, name: &str, content: &Value) -> Result<(), PersistenceError>;

	/// `None` when nothing was saved under `name` yet.
	async fn load(&self, name: &str) -> Result<Option<Value>, PersistenceError>;
}

/// File-based implementation of CacheRepository.
///
/// Each cache lives in `<data_dir>/<name>.json` next to a
/// `<name>.meta.json` describing when it was written.
pub struct FileCacheRepository {
	data_dir: PathBuf,
}

impl FileCacheRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn cache_filename(&self, name: &str) -> PathBuf {
		self.data_dir.join(format!("{}.json", name))
	}

	fn metadata_filename(&self, name: &str) -> PathBuf {
		self.data_dir.join(format!("{}.meta.json", name))
	}
}

#[async_trait]
impl CacheRepository for FileCacheRepository {
	async fn save(&self, name: &str, content: &Value) -> Result<(), PersistenceError> {
		tokio::fs::create_dir_all(&self.data_dir)
			.await
			.map_err(|e| PersistenceError::io(&self.data_dir, e))?;

		// Write then rename so a crash never leaves a torn cache behind
		let filename = self.cache_filename(name);
		let tmp_filename = self.data_dir.join(format!("{}.json.tmp", name));
		let body = serde_json::to_vec(content)?;
		tokio::fs::write(&tmp_filename, &body)
			.await
			.map_err(|e| PersistenceError::io(&tmp_filename, e))?;
		tokio::fs::rename(&tmp_filename, &filename)
			.await
			.map_err(|e| PersistenceError::io(&filename, e))?;

		let entries = match content {
			Value::Array(items) => items.len(),
			Value::Object(items) => items.len(),
			_ => 1,
		};
		let metadata = serde_json::json!({
			"entries": entries,
			"bytes": body.len(),
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});
		let metadata_filename = self.metadata_filename(name);
		tokio::fs::write(&metadata_filename, serde_json::to_string_pretty(&metadata)?)
			.await
			.map_err(|e| PersistenceError::io(&metadata_filename, e))?;

		debug!("Saved {} entries of {} to {:?}", entries, name, filename);
		Ok(())
	}

	async fn load(&self, name: &str) -> Result<Option<Value>, PersistenceError> {
		let filename = self.cache_filename(name);
		let content = match tokio::fs::read(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(PersistenceError::io(&filename, e)),
		};

		let value: Value = serde_json::from_slice(&content)?;
		info!("Loaded {} from {:?}", name, filename);
		Ok(Some(value))
	}
}
