//! Object store over a local directory tree.
//!
//! Keys map to paths below the root. Bookkeeping lives in a hidden
//! `.replhub/` directory at the root: per-key sidecars (entity tag, storage
//! class, metadata) under `meta/`, staged multipart uploads under `uploads/`,
//! and temporary files under `tmp/` that are renamed into place.

use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::checksum::{etag_for, multipart_etag};
use crate::config::MAX_PARTS;
use crate::error::{ReplError, Result};
use crate::model::{now_ms, ObjectSummary};
use crate::store::{
    check_completion, paginate, ByteRange, ListPage, ListRequest, MultipartUploadInfo,
    ObjectHead, ObjectMetadata, ObjectStore, PartInfo, PutOptions,
};

const STATE_DIR: &str = ".replhub";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    size: u64,
    last_modified: u64,
    storage_class: String,
    acl: Option<String>,
    metadata: ObjectMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadManifest {
    key: String,
    initiated: u64,
    options: PutOptions,
}

/// Object store rooted at a local directory.
pub struct FsObjectStore {
    root: PathBuf,
    name: String,
}

impl FsObjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(STATE_DIR).join("tmp")).await?;
        tokio::fs::create_dir_all(root.join(STATE_DIR).join("uploads")).await?;
        tokio::fs::create_dir_all(root.join(STATE_DIR).join("meta")).await?;
        let name = root.display().to_string();
        Ok(Self { root, name })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe || key.starts_with(STATE_DIR) {
            return Err(ReplError::AccessDenied {
                msg: format!("key {:?} is outside the store root", key),
            });
        }
        Ok(self.root.join(rel))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        let mut p = self.root.join(STATE_DIR).join("meta").join(key);
        let name = format!(
            "{}.json",
            p.file_name().and_then(|n| n.to_str()).unwrap_or("_")
        );
        p.set_file_name(name);
        p
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(STATE_DIR).join("uploads").join(upload_id)
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join("tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }

    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> Option<Sidecar> {
        let raw = tokio::fs::read(self.sidecar_path(key)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> Result<()> {
        let raw = serde_json::to_vec(sidecar)?;
        self.write_atomic(&self.sidecar_path(key), &raw).await
    }

    async fn file_stat(&self, key: &str) -> Result<(u64, u64)> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| map_io(e, key))?;
        if !meta.is_file() {
            return Err(ReplError::NotFound {
                key: key.to_string(),
            });
        }
        Ok((meta.len(), modified_ms(&meta)))
    }

    /// Sidecar for `key`, recomputed when the file changed behind our back.
    async fn describe(&self, key: &str, size: u64, last_modified: u64) -> Result<Sidecar> {
        if let Some(sidecar) = self.read_sidecar(key).await {
            if sidecar.size == size && sidecar.last_modified == last_modified {
                return Ok(sidecar);
            }
        }
        let data = tokio::fs::read(self.object_path(key)?)
            .await
            .map_err(|e| map_io(e, key))?;
        Ok(Sidecar {
            etag: etag_for(&data),
            size,
            last_modified,
            storage_class: "STANDARD".to_string(),
            acl: None,
            metadata: ObjectMetadata::default(),
        })
    }

    async fn finish_write(&self, key: &str, etag: String, options: &PutOptions) -> Result<()> {
        let (size, last_modified) = self.file_stat(key).await?;
        let sidecar = Sidecar {
            etag,
            size,
            last_modified,
            storage_class: options.storage_class.clone(),
            acl: options.acl.clone(),
            metadata: options.metadata.clone(),
        };
        self.write_sidecar(key, &sidecar).await
    }

    async fn read_manifest(&self, key: &str, upload_id: &str) -> Result<UploadManifest> {
        let raw = tokio::fs::read(self.upload_dir(upload_id).join("upload.json"))
            .await
            .map_err(|e| map_io(e, &format!("{} upload {}", key, upload_id)))?;
        let manifest: UploadManifest = serde_json::from_slice(&raw)?;
        if manifest.key != key {
            return Err(ReplError::NotFound {
                key: format!("{} upload {}", key, upload_id),
            });
        }
        Ok(manifest)
    }

    async fn stored_parts(&self, upload_id: &str) -> Result<BTreeMap<u32, (String, u64)>> {
        let mut parts = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(self.upload_dir(upload_id)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let number = name
                .to_str()
                .and_then(|n| n.strip_prefix("part-"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(number) = number {
                let data = tokio::fs::read(entry.path()).await?;
                parts.insert(number, (etag_for(&data), data.len() as u64));
            }
        }
        Ok(parts)
    }

    /// Every file key under `prefix`, sorted, with size and mtime.
    async fn walk(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        // Start at the deepest directory the prefix fully names.
        let start_rel = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let start = if start_rel.is_empty() {
            self.root.clone()
        } else {
            self.object_path(start_rel)?
        };

        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let rel = match path.strip_prefix(&self.root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(STATE_DIR) {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() && key.starts_with(prefix) {
                    found.push(ObjectSummary {
                        key,
                        size: meta.len(),
                        etag: String::new(),
                        version_id: None,
                        last_modified: modified_ms(&meta),
                        storage_class: "STANDARD".to_string(),
                    });
                }
            }
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }
}

fn modified_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn map_io(e: std::io::Error, key: &str) -> ReplError {
    match e.kind() {
        ErrorKind::NotFound => ReplError::NotFound {
            key: key.to_string(),
        },
        ErrorKind::PermissionDenied => ReplError::AccessDenied {
            msg: format!("{}: {}", key, e),
        },
        _ => ReplError::Io(e),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.name
    }

    async fn list_page(&self, req: &ListRequest) -> Result<ListPage> {
        let entries = self.walk(&req.prefix).await?;
        let mut page = paginate(entries, req);
        for obj in page.objects.iter_mut() {
            let sidecar = self.describe(&obj.key, obj.size, obj.last_modified).await?;
            obj.etag = sidecar.etag;
            obj.storage_class = sidecar.storage_class;
        }
        Ok(page)
    }

    async fn head(&self, key: &str, _version_id: Option<&str>) -> Result<ObjectHead> {
        let (size, last_modified) = self.file_stat(key).await?;
        let sidecar = self.describe(key, size, last_modified).await?;
        Ok(ObjectHead {
            size,
            etag: sidecar.etag,
            version_id: None,
            last_modified,
            storage_class: sidecar.storage_class,
            metadata: sidecar.metadata,
        })
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        _version_id: Option<&str>,
    ) -> Result<Bytes> {
        let path = self.object_path(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_io(e, key))?;
        match range {
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Some(r) => {
                let len = file.metadata().await?.len();
                let start = r.start.min(len);
                let end = r.end.min(len).max(start);
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<String> {
        let path = self.object_path(key)?;
        let etag = etag_for(&data);
        if key.ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
            return Ok(etag);
        }
        self.write_atomic(&path, &data).await?;
        self.finish_write(key, etag.clone(), options).await?;
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(map_io(e, key)),
        }
        match tokio::fs::remove_file(self.sidecar_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn initiate_multipart(&self, key: &str, options: &PutOptions) -> Result<String> {
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let manifest = UploadManifest {
            key: key.to_string(),
            initiated: now_ms(),
            options: options.clone(),
        };
        let dir = self.upload_dir(&upload_id);
        tokio::fs::create_dir_all(&dir).await?;
        self.write_atomic(&dir.join("upload.json"), &serde_json::to_vec(&manifest)?)
            .await?;
        debug!(root = %self.name, key = key, upload_id = %upload_id, "staged multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 || part_number as u64 > MAX_PARTS {
            return Err(ReplError::Multipart {
                upload_id: upload_id.to_string(),
                msg: format!("part number {} out of range", part_number),
            });
        }
        self.read_manifest(key, upload_id).await?;
        let path = self
            .upload_dir(upload_id)
            .join(format!("part-{:05}", part_number));
        self.write_atomic(&path, &data).await?;
        Ok(etag_for(&data))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<String> {
        let manifest = self.read_manifest(key, upload_id).await?;
        let stored = self.stored_parts(upload_id).await?;
        let etags: BTreeMap<u32, String> = stored
            .iter()
            .map(|(n, (etag, _))| (*n, etag.clone()))
            .collect();
        check_completion(upload_id, parts, &etags)?;

        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        let mut out = tokio::fs::File::create(&tmp).await?;
        let dir = self.upload_dir(upload_id);
        for part in parts {
            let data = tokio::fs::read(dir.join(format!("part-{:05}", part.part_number))).await?;
            out.write_all(&data).await?;
        }
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &target).await?;

        let part_etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        let etag = multipart_etag(&part_etags);
        self.finish_write(key, etag.clone(), &manifest.options).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(etag)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.read_manifest(key, upload_id).await?;
        tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await?;
        debug!(root = %self.name, key = key, upload_id = upload_id, "discarded staged upload");
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<MultipartUploadInfo>> {
        let mut uploads = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(STATE_DIR).join("uploads")).await?;
        while let Some(entry) = dir.next_entry().await? {
            let raw = match tokio::fs::read(entry.path().join("upload.json")).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let manifest: UploadManifest = serde_json::from_slice(&raw)?;
            if manifest.key.starts_with(prefix) {
                uploads.push(MultipartUploadInfo {
                    key: manifest.key,
                    upload_id: entry.file_name().to_string_lossy().into_owned(),
                    initiated: manifest.initiated,
                    metadata: manifest.options.metadata,
                });
            }
        }
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        Ok(uploads)
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartInfo>> {
        self.read_manifest(key, upload_id).await?;
        Ok(self
            .stored_parts(upload_id)
            .await?
            .into_iter()
            .map(|(part_number, (etag, size))| PartInfo {
                part_number,
                etag,
                size,
            })
            .collect())
    }
}
