//! Object storage for raw uploads and extracted images.
//!
//! Objects are addressed by slash-separated keys. The local adapter maps a
//! key onto a file below its root directory and hands out HMAC-signed,
//! time-limited URLs that the HTTP surface serves at `/objects/{key}`.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ServiceResult, StorageError};

type HmacSha256 = Hmac<Sha256>;

const DEVELOPMENT_SECRET: &str = "docpipe-development-secret";

/// The chunk an uploaded image belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOwner {
    pub project_id: String,
    pub document_id: String,
    pub chunk_id: String,
}

/// Result of an image upload as reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageUpload {
    Uploaded { key: String },
    Error { message: String },
}

/// Blob storage used by the pipeline
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, key: &str) -> ServiceResult<Bytes>;

    async fn write(&self, key: &str, bytes: Bytes) -> ServiceResult<()>;

    /// Upload a parser-extracted image file under its owning chunk.
    async fn write_image(&self, path: &Path, owner: &ImageOwner) -> ImageUpload;

    /// Time-limited read URLs, one per key, in the same order.
    fn presign(&self, keys: &[String], ttl: Duration) -> ServiceResult<Vec<String>>;

    /// Check a presigned URL's signature and expiry.
    fn verify_presigned(&self, key: &str, expires: u64, sig: &str) -> ServiceResult<()>;

    /// Delete an object. `false` means there was nothing to delete.
    async fn delete(&self, key: &str) -> ServiceResult<bool>;
}

/// Filesystem-backed object store
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    signer: UrlSigner,
}

impl LocalObjectStore {
    pub fn new(
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        secret: Option<&str>,
    ) -> ServiceResult<Self> {
        let secret = match secret {
            Some(secret) => secret,
            None => {
                warn!("No presign secret configured, using the development secret");
                DEVELOPMENT_SECRET
            }
        };

        Ok(Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signer: UrlSigner::new(secret.as_bytes())?,
        })
    }

    fn object_path(&self, key: &str) -> ServiceResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn read(&self, key: &str) -> ServiceResult<Bytes> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }
            .into()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn write(&self, key: &str, bytes: Bytes) -> ServiceResult<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| io_error(key, e))?;

        debug!(key, size = bytes.len(), "Stored object");
        Ok(())
    }

    async fn write_image(&self, path: &Path, owner: &ImageOwner) -> ImageUpload {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return ImageUpload::Error {
                message: format!("image path has no file name: {}", path.display()),
            };
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ImageUpload::Error {
                    message: format!("cannot read {}: {}", path.display(), e),
                };
            }
        };

        let key = image_key(owner, &file_name);
        match self.write(&key, Bytes::from(bytes)).await {
            Ok(()) => ImageUpload::Uploaded { key },
            Err(e) => ImageUpload::Error {
                message: crate::error::format_error_chain_ref(&e),
            },
        }
    }

    fn presign(&self, keys: &[String], ttl: Duration) -> ServiceResult<Vec<String>> {
        let expires = unix_now().saturating_add(ttl.as_secs());
        keys.iter()
            .map(|key| {
                validate_key(key)?;
                let sig = self.signer.sign(key, expires);
                Ok(format!(
                    "{}/objects/{}?expires={}&sig={}",
                    self.public_base_url, key, expires, sig
                ))
            })
            .collect()
    }

    fn verify_presigned(&self, key: &str, expires: u64, sig: &str) -> ServiceResult<()> {
        validate_key(key)?;
        self.signer.verify(key, expires, sig, unix_now())?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ServiceResult<bool> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

/// HMAC-SHA256 signer for object URLs
struct UrlSigner {
    keyed: HmacSha256,
}

impl UrlSigner {
    fn new(secret: &[u8]) -> Result<Self, StorageError> {
        let keyed = HmacSha256::new_from_slice(secret).map_err(|_| StorageError::Signature {
            reason: "unusable presign secret".to_string(),
        })?;
        Ok(Self { keyed })
    }

    fn mac(&self, key: &str, expires: u64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    fn sign(&self, key: &str, expires: u64) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(key, expires).finalize().into_bytes())
    }

    fn verify(&self, key: &str, expires: u64, sig: &str, now: u64) -> Result<(), StorageError> {
        if expires < now {
            return Err(StorageError::Signature {
                reason: "link expired".to_string(),
            });
        }
        let provided = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| StorageError::Signature {
                reason: "malformed signature".to_string(),
            })?;
        self.mac(key, expires)
            .verify_slice(&provided)
            .map_err(|_| StorageError::Signature {
                reason: "signature mismatch".to_string(),
            })
    }
}

/// Key for an image extracted from a chunk
pub fn image_key(owner: &ImageOwner, file_name: &str) -> String {
    format!(
        "images/{}/{}/{}/{}_{}",
        owner.project_id,
        owner.document_id,
        owner.chunk_id,
        short_id(),
        sanitize_filename(file_name)
    )
}

/// Key for a raw document upload
pub fn upload_key(project_id: &str, filename: &str) -> String {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| sanitize_filename(&s.to_string_lossy()))
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    format!("uploads/{}/{}_{}{}", project_id, short_id(), stem, ext)
}

/// Sanitize a string for use inside an object key
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn io_error(key: &str, source: std::io::Error) -> crate::error::ServiceError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
    .into()
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;

    fn store(dir: &Path) -> LocalObjectStore {
        LocalObjectStore::new(dir.join("objects"), "http://files.test/", Some("s3cret")).unwrap()
    }

    fn owner() -> ImageOwner {
        ImageOwner {
            project_id: "p1".to_string(),
            document_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .write("uploads/p1/abc_notes.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let bytes = store.read("uploads/p1/abc_notes.txt").await.unwrap();
        assert_eq!(&bytes[..], b"hello");

        assert!(store.delete("uploads/p1/abc_notes.txt").await.unwrap());
        assert!(!store.delete("uploads/p1/abc_notes.txt").await.unwrap());
        assert!(matches!(
            store.read("uploads/p1/abc_notes.txt").await,
            Err(ServiceError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for key in ["../secret", "/etc/passwd", "a//b", "a/./b", ""] {
            assert!(
                matches!(
                    store.read(key).await,
                    Err(ServiceError::Storage(StorageError::InvalidKey { .. }))
                ),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_write_image_uses_owner_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let image = dir.path().join("figure 1.png");
        std::fs::write(&image, b"png").unwrap();

        let ImageUpload::Uploaded { key } = store.write_image(&image, &owner()).await else {
            panic!("upload should succeed");
        };
        assert!(key.starts_with("images/p1/d1/c1/"));
        assert!(key.ends_with("_figure_1.png"));
        assert_eq!(&store.read(&key).await.unwrap()[..], b"png");
    }

    #[tokio::test]
    async fn test_write_image_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let upload = store
            .write_image(&dir.path().join("missing.png"), &owner())
            .await;
        assert!(matches!(upload, ImageUpload::Error { .. }));
    }

    #[test]
    fn test_presigned_urls_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = "images/p1/d1/c1/abcd1234_a.png".to_string();

        let urls = store
            .presign(std::slice::from_ref(&key), Duration::from_secs(900))
            .unwrap();
        let url = &urls[0];
        assert!(url.starts_with("http://files.test/objects/images/p1/d1/c1/"));

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut sig = "";
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("sig", v) => sig = v,
                _ => {}
            }
        }

        store.verify_presigned(&key, expires, sig).unwrap();
        assert!(
            store
                .verify_presigned("images/p1/d1/c1/other.png", expires, sig)
                .is_err()
        );
        assert!(store.verify_presigned(&key, expires + 1, sig).is_err());
    }

    #[test]
    fn test_expired_signature_rejected() {
        let signer = UrlSigner::new(b"k").unwrap();
        let sig = signer.sign("a/b", 100);
        assert!(signer.verify("a/b", 100, &sig, 50).is_ok());
        let err = signer.verify("a/b", 100, &sig, 101).unwrap_err();
        assert!(matches!(err, StorageError::Signature { ref reason } if reason == "link expired"));
    }

    #[test]
    fn test_keys() {
        let key = upload_key("p1", "Field Notes.PDF");
        assert!(key.starts_with("uploads/p1/"));
        assert!(key.ends_with("_Field_Notes.pdf"));
        assert_eq!(sanitize_filename("File/Name:Test"), "File_Name_Test");
    }
}
