/// Application code the reference server returns for a successful request.
pub const DEFAULT_SUCCESS_CODE: i64 = 20000;

/// Multipart field that carries the raw chunk bytes.
pub const DEFAULT_FILE_PARAMETER_NAME: &str = "multipartFile";

/// Server-side folder that receives uploads when none is configured.
pub const DEFAULT_UPLOAD_FOLDER_PATH: &str = "/";

/// Path of the skip-check endpoint (`GET`).
pub const SKIP_CHECK_PATH: &str = "/fileUpload/chunk";

/// Path of the chunk upload endpoint (`POST`).
pub const CHUNK_UPLOAD_PATH: &str = "/fileUpload/chunk";

/// Path of the delete-chunks endpoint (`DELETE`).
pub const DELETE_CHUNKS_PATH: &str = "/fileUpload/chunk";

/// Path of the merge endpoint (`POST`).
pub const MERGE_PATH: &str = "/fileUpload/mergeFile";
