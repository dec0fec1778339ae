use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SUCCESS_CODE;

/// Response envelope returned by every upload endpoint.
///
/// `data` is kept as raw JSON so each endpoint can decode its own payload
/// shape with [`ApiResult::parse_data`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult {
    #[serde(default)]
    pub success: bool,
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<serde_json::value::RawValue>>,
}

impl ApiResult {
    /// Creates a successful result without data.
    pub fn success() -> Self {
        Self {
            success: true,
            code: DEFAULT_SUCCESS_CODE,
            message: String::new(),
            data: None,
        }
    }

    /// Creates a failed result with the given application code.
    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Returns `true` if `code` is one of the accepted success codes.
    pub fn is_success(&self, success_codes: &[i64]) -> bool {
        success_codes.contains(&self.code)
    }

    /// Deserializes `data` into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChunkResult, SkipCheckData};

    #[test]
    fn success_code_membership() {
        let ok = ApiResult::success();
        assert!(ok.is_success(&[DEFAULT_SUCCESS_CODE]));
        assert!(!ok.is_success(&[]));

        let err = ApiResult::error(50014, "token expired");
        assert!(!err.is_success(&[DEFAULT_SUCCESS_CODE]));
        assert!(err.is_success(&[DEFAULT_SUCCESS_CODE, 50014]));
    }

    #[test]
    fn parse_skip_check_envelope() {
        let json = r#"{
            "success": true,
            "code": 20000,
            "message": "ok",
            "data": {"chunkResult": {"skipUpload": false, "uploadedChunkList": [1, 2]}}
        }"#;
        let result: ApiResult = serde_json::from_str(json).unwrap();
        let data: SkipCheckData = result.parse_data().unwrap().unwrap();
        assert!(!data.chunk_result.skip_upload);
        assert_eq!(data.chunk_result.uploaded_chunk_list, vec![1, 2]);
    }

    #[test]
    fn envelope_without_data() {
        let json = r#"{"code": 20001, "message": "upload failed"}"#;
        let result: ApiResult = serde_json::from_str(json).unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "upload failed");
        assert!(result.parse_data::<SkipCheckData>().unwrap().is_none());
    }

    #[test]
    fn data_survives_reserialization() {
        let json = r#"{
            "success": true,
            "code": 20000,
            "data": {"chunkResult":{"skipUpload":true,"uploadedChunkList":[]}}
        }"#;
        let result: ApiResult = serde_json::from_str(json).unwrap();
        let reencoded = serde_json::to_string(&result).unwrap();
        assert!(reencoded.contains("\"skipUpload\":true"));

        let parsed: ApiResult = serde_json::from_str(&reencoded).unwrap();
        let back: SkipCheckData = parsed.parse_data().unwrap().unwrap();
        assert_eq!(
            back,
            SkipCheckData {
                chunk_result: ChunkResult {
                    skip_upload: true,
                    uploaded_chunk_list: vec![],
                },
            }
        );
    }
}
