use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Query string of the skip-check request.
///
/// The server keys stored chunks by fingerprint, which it calls `identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipCheckQuery {
    #[serde(rename = "identifier")]
    pub fingerprint: String,
    pub filename: String,
    pub upload_folder_path: String,
}

/// Text fields sent alongside the raw bytes of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadForm {
    /// 1-based chunk number.
    pub chunk_number: u32,
    /// Nominal chunk size; the last chunk may be shorter.
    pub chunk_size: u64,
    /// Actual byte length of this chunk.
    pub current_chunk_size: u64,
    pub total_size: u64,
    #[serde(rename = "identifier")]
    pub fingerprint: String,
    pub filename: String,
    pub relative_path: String,
    pub total_chunks: u32,
}

impl ChunkUploadForm {
    /// Returns the form as `(field, value)` pairs in wire order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("chunkNumber", self.chunk_number.to_string()),
            ("chunkSize", self.chunk_size.to_string()),
            ("currentChunkSize", self.current_chunk_size.to_string()),
            ("totalSize", self.total_size.to_string()),
            ("identifier", self.fingerprint.clone()),
            ("filename", self.filename.clone()),
            ("relativePath", self.relative_path.clone()),
            ("totalChunks", self.total_chunks.to_string()),
        ]
    }
}

/// Query string of the delete-chunks request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChunkQuery {
    #[serde(rename = "identifier")]
    pub fingerprint: String,
    pub upload_folder_path: String,
}

/// Query string carrying only the server-side upload folder.
///
/// Used by the chunk upload and merge requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderQuery {
    pub upload_folder_path: String,
}

/// JSON body of the merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFileInfo {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relative_path: String,
    pub unique_identifier: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Server answer to a skip-check query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    /// The complete file already exists server-side.
    #[serde(default)]
    pub skip_upload: bool,
    /// 1-based numbers of the chunks already stored.
    #[serde(default, alias = "uploadedChunks")]
    pub uploaded_chunk_list: Vec<u32>,
}

/// `data` payload of the skip-check envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipCheckData {
    pub chunk_result: ChunkResult,
}
