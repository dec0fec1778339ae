use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chunkup_protocol::{
    ApiResult, ChunkResult, ChunkUploadForm, DeleteChunkQuery, SkipCheckQuery, UploadedFileInfo,
};

use crate::TransferError;

/// Boxed future returned by [`UploadEndpoint`] methods.
pub type EndpointFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Transport progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Everything needed to send one chunk.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub form: ChunkUploadForm,
    pub data: Bytes,
    /// File name of the multipart file part.
    pub filename: String,
    pub content_type: String,
    pub upload_folder_path: String,
}

/// Remote side of a transfer.
///
/// Implementations map transport failures and non-2xx statuses to
/// [`TransferError::Network`]. Application codes are returned untouched in
/// the [`ApiResult`]; the caller decides which codes count as success.
pub trait UploadEndpoint: Send + Sync {
    /// Asks whether the file is already stored, fully or in part.
    fn skip_check(&self, query: SkipCheckQuery) -> EndpointFuture<'_, ChunkResult>;

    /// Sends one chunk. `progress` is invoked as bytes leave the client.
    fn upload_chunk(&self, upload: ChunkUpload, progress: ProgressFn)
    -> EndpointFuture<'_, ApiResult>;

    /// Drops every chunk the server holds for the fingerprint.
    fn delete_chunks(&self, query: DeleteChunkQuery) -> EndpointFuture<'_, ()>;

    /// Asks the server to assemble the uploaded chunks.
    ///
    /// Returns `None` when the server answered 2xx without a result envelope
    /// (for example a binary body).
    fn merge(
        &self,
        info: UploadedFileInfo,
        upload_folder_path: String,
    ) -> EndpointFuture<'_, Option<ApiResult>>;
}
