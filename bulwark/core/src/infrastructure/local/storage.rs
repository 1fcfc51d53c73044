// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Blob Store
//!
//! Fallback for the `storage` capability. Blobs live under
//! `<root>/<tenant>/<key>`; keys are relative paths and may not escape the
//! tenant directory.
//!
//! **Limitations:**
//! - Single node only
//! - No replication

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::domain::capability::{Backend, StorageBackend};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

const MAX_KEY_LEN: usize = 1024;

pub struct FilesystemBlobStore {
    name: String,
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Create the store, creating `root` if it does not exist.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            BackendError::Unavailable(format!("failed to create blob root {}: {}", root.display(), e))
        })?;
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `<root>/<tenant>/<key>`, rejecting anything that could leave
    /// the tenant directory.
    fn resolve(&self, tenant: &TenantId, key: &str) -> Result<PathBuf, BackendError> {
        let tenant_dir = sanitize_segment(tenant.as_str())
            .ok_or_else(|| BackendError::InvalidRequest(format!("invalid tenant id: {:?}", tenant.as_str())))?;
        let relative = sanitize_key(key)?;
        Ok(self.root.join(tenant_dir).join(relative))
    }
}

fn sanitize_segment(segment: &str) -> Option<&str> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0']);
    valid.then_some(segment)
}

fn sanitize_key(key: &str) -> Result<PathBuf, BackendError> {
    if key.is_empty() {
        return Err(BackendError::InvalidRequest("storage key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(BackendError::InvalidRequest(format!("storage key longer than {} bytes", MAX_KEY_LEN)));
    }
    if key.contains('\0') || key.contains('\\') {
        return Err(BackendError::InvalidRequest("storage key contains an illegal character".to_string()));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!(key = %key, "rejected storage key escaping the tenant directory");
                return Err(BackendError::InvalidRequest(format!("storage key must be a relative path: {}", key)));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(BackendError::InvalidRequest(format!("storage key has no file name: {}", key)));
    }
    Ok(normalized)
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> BackendError {
    BackendError::Unavailable(format!("{} {}: {}", op, path.display(), e))
}

#[async_trait]
impl Backend for FilesystemBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| io_error("stat", &self.root, e))?;
        if metadata.permissions().readonly() {
            return Err(BackendError::Unavailable(format!("{} is read-only", self.root.display())));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBlobStore {
    async fn store(&self, tenant: &TenantId, key: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        let path = self.resolve(tenant, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }

        // Write-then-rename so readers never see a partial blob
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_error("rename", &path, e))?;
        Ok(())
    }

    async fn retrieve(&self, tenant: &TenantId, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.resolve(tenant, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn delete(&self, tenant: &TenantId, key: &str) -> Result<(), BackendError> {
        let path = self.resolve(tenant, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}
