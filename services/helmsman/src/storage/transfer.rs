//! Presigned-URL transfer: HTTP PUT uploads and GET downloads.
//!
//! The edge never holds object-storage credentials; every operation targets
//! an orchestrator-supplied presigned URL. The store is idempotent on
//! identical PUT, so retries are left to the calling policy.

use super::StorageError;
use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

/// Content types the object store expects per artifact kind.
pub fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".ts") {
        "video/MP2T"
    } else if filename.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "application/octet-stream"
    }
}

/// Shared HTTP client for presigned transfers.
#[derive(Clone)]
pub struct Transfer {
    client: reqwest::Client,
}

impl Transfer {
    pub fn new() -> Self {
        Transfer {
            client: reqwest::Client::new(),
        }
    }

    /// PUT a file to a presigned URL, streaming it in chunks.
    ///
    /// Each transferred chunk's size is reported through `progress` when
    /// provided. Returns the file size on success.
    pub async fn put_file(
        &self,
        url: &str,
        path: &Path,
        progress: Option<mpsc::UnboundedSender<u64>>,
    ) -> Result<u64, StorageError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let content_type = path
            .file_name()
            .map(|n| content_type_for(&n.to_string_lossy()))
            .unwrap_or("application/octet-stream");

        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let (Some(tx), Ok(bytes)) = (&progress, chunk) {
                let _ = tx.send(bytes.len() as u64);
            }
        });
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| StorageError::Transfer(format!("PUT {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Transfer(format!(
                "PUT {url}: status {}",
                response.status()
            )));
        }
        Ok(size)
    }

    /// PUT an in-memory document (manifests) to a presigned URL.
    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &'static str,
    ) -> Result<(), StorageError> {
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Transfer(format!("PUT {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Transfer(format!(
                "PUT {url}: status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// GET a presigned URL into `dest`, via a temp file renamed into place
    /// so readers never observe a partial artifact.
    pub async fn get_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<mpsc::UnboundedSender<u64>>,
    ) -> Result<u64, StorageError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Transfer(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Transfer(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }

        let tmp_name = format!(
            "{}.part",
            dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        );
        let tmp = dest.with_file_name(tmp_name);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| StorageError::Transfer(format!("GET {url}: {e}")))?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
            if let Some(tx) = &progress {
                let _ = tx.send(bytes.len() as u64);
            }
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(written)
    }

    /// GET a presigned URL into memory (manifests only).
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Transfer(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(StorageError::Transfer(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Transfer(format!("GET {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}
