use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{CatalogEntry, ColumnsSchema, FileDataType, FileLocation, TableKey};

/// Key prefix for table data inside the bucket
const REMOTE_DATA_PREFIX: &str = "data";

/// Credentials for an S3-compatible bucket
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct S3Credentials {
    pub key_id: String,
    pub secret: String,
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl S3Credentials {
    /// Build an object store client for the bucket
    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::new()
            .with_access_key_id(&self.key_id)
            .with_secret_access_key(&self.secret)
            .with_region(&self.region)
            .with_bucket_name(&self.bucket);

        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }

        Ok(Arc::new(builder.build()?))
    }
}

/// A freshly encoded columnar file waiting to be committed
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub key: TableKey,
    pub path: PathBuf,
    pub column_schema: ColumnsSchema,
    /// Directory relative to the data root, e.g. `crm/users`
    pub target_dir: String,
    pub file_name: String,
}

/// Directory of a table relative to the data root
pub fn table_dir(key: &TableKey) -> String {
    format!("{}/{}", key.schema_name, key.table_name)
}

/// `<millis>-<random>`, used for both data files and snapshot directories
pub fn unique_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &suffix[..8])
}

/// Durable storage for table files
///
/// `commit` takes ownership of a staged file and returns the catalog entry that
/// points at its table; the caller is responsible for upserting it.
#[async_trait]
pub trait DataBackend: Send + Sync {
    fn file_location(&self) -> FileLocation;

    /// Move a staged file into durable storage
    async fn commit(&self, staged: StagedFile) -> Result<CatalogEntry>;

    /// Make a table's files available on local disk, returning the directory
    async fn local_dir(&self, entry: &CatalogEntry) -> Result<PathBuf>;

    /// Delete everything stored under a relative directory
    async fn remove_dir(&self, relative_dir: &str) -> Result<()>;

    /// Directory where files are encoded before commit
    fn staging_dir(&self) -> PathBuf;
}

/// Files under `<data_root>/<schema>/<table>/` on local disk
pub struct LocalBackend {
    data_root: PathBuf,
}

impl LocalBackend {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}

#[async_trait]
impl DataBackend for LocalBackend {
    fn file_location(&self) -> FileLocation {
        FileLocation::Local
    }

    async fn commit(&self, staged: StagedFile) -> Result<CatalogEntry> {
        let folder = self.data_root.join(&staged.target_dir);
        tokio::fs::create_dir_all(&folder).await?;
        let destination = folder.join(&staged.file_name);
        tokio::fs::rename(&staged.path, &destination).await?;
        debug!("Committed {} to {}", staged.key, destination.display());

        Ok(CatalogEntry {
            schema_name: staged.key.schema_name,
            table_name: staged.key.table_name,
            location: folder.to_string_lossy().into_owned(),
            data_type: FileDataType::Parquet,
            file_location: FileLocation::Local,
            column_schema: staged.column_schema,
        })
    }

    async fn local_dir(&self, entry: &CatalogEntry) -> Result<PathBuf> {
        Ok(PathBuf::from(&entry.location))
    }

    async fn remove_dir(&self, relative_dir: &str) -> Result<()> {
        let dir = self.data_root.join(relative_dir);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.data_root.join("_staging")
    }
}

/// Files uploaded to a bucket under `data/<schema>/<table>/`
///
/// Local copies are kept in `cache_root` for query execution only.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    cache_root: PathBuf,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            cache_root: cache_root.into(),
        }
    }

    pub fn from_credentials(credentials: &S3Credentials, cache_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(
            credentials.build_store()?,
            credentials.bucket.clone(),
            cache_root,
        ))
    }

    fn remote_prefix(relative_dir: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", REMOTE_DATA_PREFIX, relative_dir))
    }

    /// Relative directory encoded in an `s3://bucket/data/...` location
    fn relative_dir<'a>(&self, location: &'a str) -> Result<&'a str> {
        let prefix = format!("s3://{}/{}/", self.bucket, REMOTE_DATA_PREFIX);
        location
            .strip_prefix(&prefix)
            .map(|rest| rest.trim_end_matches('/'))
            .ok_or_else(|| EngineError::Config(format!("Location {} is not in bucket {}", location, self.bucket)))
    }
}

#[async_trait]
impl DataBackend for ObjectStoreBackend {
    fn file_location(&self) -> FileLocation {
        FileLocation::Remote
    }

    async fn commit(&self, staged: StagedFile) -> Result<CatalogEntry> {
        let object = Self::remote_prefix(&staged.target_dir).child(staged.file_name.as_str());
        let bytes = tokio::fs::read(&staged.path).await?;
        let size = bytes.len();
        self.store.put(&object, PutPayload::from(bytes)).await?;
        if let Err(e) = tokio::fs::remove_file(&staged.path).await {
            warn!("Failed to remove staged file {}: {}", staged.path.display(), e);
        }
        info!("Uploaded {} bytes for {} to {}", size, staged.key, object);

        Ok(CatalogEntry {
            schema_name: staged.key.schema_name,
            table_name: staged.key.table_name,
            location: format!("s3://{}/{}/{}", self.bucket, REMOTE_DATA_PREFIX, staged.target_dir),
            data_type: FileDataType::Parquet,
            file_location: FileLocation::Remote,
            column_schema: staged.column_schema,
        })
    }

    async fn local_dir(&self, entry: &CatalogEntry) -> Result<PathBuf> {
        if entry.file_location == FileLocation::Local {
            return Ok(PathBuf::from(&entry.location));
        }

        let relative = self.relative_dir(&entry.location)?;
        let local = self.cache_root.join(relative);
        tokio::fs::create_dir_all(&local).await?;

        let prefix = Self::remote_prefix(relative);
        let mut listing = self.store.list(Some(&prefix));
        let mut downloaded = 0usize;
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            let Some(suffix) = meta.location.prefix_match(&prefix) else {
                continue;
            };
            let parts: Vec<String> = suffix.map(|part| part.as_ref().to_string()).collect();
            let target = parts.iter().fold(local.clone(), |path, part| path.join(part));
            if tokio::fs::try_exists(&target).await? {
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = self.store.get(&meta.location).await?.bytes().await?;
            tokio::fs::write(&target, &data).await?;
            downloaded += 1;
        }

        if downloaded > 0 {
            debug!("Downloaded {} files for {}", downloaded, entry.key());
        }
        Ok(local)
    }

    async fn remove_dir(&self, relative_dir: &str) -> Result<()> {
        let prefix = Self::remote_prefix(relative_dir);
        let mut listing = self.store.list(Some(&prefix));
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            if let Err(e) = self.store.delete(&meta.location).await {
                warn!("Failed to delete {}: {}", meta.location, e);
            }
        }

        match tokio::fs::remove_dir_all(self.cache_root.join(relative_dir)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.cache_root.join("_staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnSchema, PrimitiveType};
    use object_store::memory::InMemory;
    use tempfile::tempdir;

    fn staged(dir: &Path, key: &TableKey) -> StagedFile {
        let staging = dir.join("staged.parquet");
        std::fs::write(&staging, b"PAR1").unwrap();
        let mut column_schema = ColumnsSchema::new();
        column_schema.insert("id".to_string(), ColumnSchema::new(PrimitiveType::Double, true));
        StagedFile {
            key: key.clone(),
            path: staging,
            column_schema,
            target_dir: table_dir(key),
            file_name: format!("{}.parquet", unique_name()),
        }
    }

    #[tokio::test]
    async fn test_local_commit_moves_file() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("data"));
        let key = TableKey::new("crm", "users");
        let file = staged(dir.path(), &key);
        let staged_path = file.path.clone();
        let file_name = file.file_name.clone();

        let entry = backend.commit(file).await.unwrap();

        assert_eq!(entry.file_location, FileLocation::Local);
        assert!(!staged_path.exists());
        assert!(Path::new(&entry.location).join(file_name).exists());
        assert_eq!(backend.local_dir(&entry).await.unwrap(), PathBuf::from(&entry.location));
    }

    #[tokio::test]
    async fn test_object_store_commit_and_download() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(store.clone(), "bucket", dir.path().join("cache"));
        let key = TableKey::new("crm", "users");
        let file = staged(dir.path(), &key);
        let staged_path = file.path.clone();
        let file_name = file.file_name.clone();

        let entry = backend.commit(file).await.unwrap();
        assert_eq!(entry.location, "s3://bucket/data/crm/users");
        assert_eq!(entry.file_location, FileLocation::Remote);
        // Local temp copy removed after upload
        assert!(!staged_path.exists());

        let object = ObjectPath::from(format!("data/crm/users/{}", file_name));
        assert!(store.head(&object).await.is_ok());

        let local = backend.local_dir(&entry).await.unwrap();
        assert_eq!(std::fs::read(local.join(&file_name)).unwrap(), b"PAR1");
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_staged_file() {
        let dir = tempdir().unwrap();
        // A regular file as the store root makes every put fail
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&root).unwrap());
        let backend = ObjectStoreBackend::new(store, "bucket", dir.path().join("cache"));
        let key = TableKey::new("crm", "users");
        let file = staged(dir.path(), &key);
        let staged_path = file.path.clone();

        assert!(backend.commit(file).await.is_err());
        assert_eq!(std::fs::read(&staged_path).unwrap(), b"PAR1");
    }

    #[tokio::test]
    async fn test_remove_dir_tolerates_missing() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("data"));
        backend.remove_dir("crm/missing").await.unwrap();
    }

    #[test]
    fn test_relative_dir_rejects_foreign_bucket() {
        let backend = ObjectStoreBackend::new(Arc::new(InMemory::new()), "bucket", "cache");
        assert_eq!(backend.relative_dir("s3://bucket/data/crm/users").unwrap(), "crm/users");
        assert!(backend.relative_dir("s3://other/data/crm/users").is_err());
    }
}
