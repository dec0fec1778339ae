//! HTTP implementation of [`UploadEndpoint`] on top of `reqwest`.

use std::time::Duration;

use bytes::Bytes;
use chunkup_protocol::{
    ApiResult, ChunkResult, DeleteChunkQuery, FolderQuery, SkipCheckData, SkipCheckQuery,
    UploadedFileInfo,
};
use chunkup_transfer::{ChunkUpload, EndpointFuture, ProgressFn, TransferError, UploadEndpoint};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};

use crate::config::{HttpEndpointConfig, UploaderConfig};
use crate::error::UploadError;

/// Size of the slices the chunk body is streamed in; progress is reported
/// once per slice.
const BODY_SLICE: usize = 64 * 1024;

/// Talks to an upload server over HTTP.
pub struct HttpEndpoint {
    http: reqwest::Client,
    config: HttpEndpointConfig,
    success_codes: Vec<i64>,
}

impl HttpEndpoint {
    /// Builds a client with the configured default headers and timeout.
    pub fn new(config: &UploaderConfig) -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UploadError::Config(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| UploadError::Config(format!("invalid value for header {name}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if config.endpoint.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.endpoint.timeout_secs));
        }

        Ok(Self {
            http: builder.build()?,
            config: config.endpoint.clone(),
            success_codes: config.success_codes.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Rejects non-2xx responses, keeping the body for the error.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UploadError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UploadError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn fetch_skip_check(&self, query: SkipCheckQuery) -> Result<ChunkResult, UploadError> {
        let resp = self
            .http
            .get(self.url(&self.config.skip_check_path))
            .query(&query)
            .send()
            .await?;
        let body = Self::check_status(resp).await?.bytes().await?;
        let result: ApiResult = serde_json::from_slice(&body)?;
        if !result.is_success(&self.success_codes) {
            return Err(TransferError::Application {
                code: result.code,
                message: result.message,
            }
            .into());
        }
        let data: Option<SkipCheckData> = result.parse_data()?;
        Ok(data.map(|d| d.chunk_result).unwrap_or_default())
    }

    async fn send_chunk(
        &self,
        upload: ChunkUpload,
        progress: ProgressFn,
    ) -> Result<ApiResult, UploadError> {
        let total = upload.data.len() as u64;
        let body = progress_body(upload.data, progress);
        let part = Part::stream_with_length(body, total)
            .file_name(upload.filename)
            .mime_str(&upload.content_type)?;

        let mut form = Form::new();
        for (name, value) in upload.form.fields() {
            form = form.text(name, value);
        }
        form = form.part(self.config.file_parameter_name.clone(), part);

        let resp = self
            .http
            .post(self.url(&self.config.chunk_upload_path))
            .query(&FolderQuery {
                upload_folder_path: upload.upload_folder_path,
            })
            .multipart(form)
            .send()
            .await?;
        let body = Self::check_status(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_delete(&self, query: DeleteChunkQuery) -> Result<(), UploadError> {
        let resp = self
            .http
            .delete(self.url(&self.config.delete_path))
            .query(&query)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn send_merge(
        &self,
        info: UploadedFileInfo,
        upload_folder_path: String,
    ) -> Result<Option<ApiResult>, UploadError> {
        let resp = self
            .http
            .post(self.url(&self.config.merge_path))
            .query(&FolderQuery { upload_folder_path })
            .json(&info)
            .send()
            .await?;
        let body = Self::check_status(resp).await?.bytes().await?;
        // Some servers stream the merged file back instead of an envelope.
        Ok(serde_json::from_slice(&body).ok())
    }
}

/// Streams `data` in slices, reporting cumulative bytes as each slice is
/// handed to the transport.
fn progress_body(data: Bytes, progress: ProgressFn) -> reqwest::Body {
    let total = data.len() as u64;
    let mut slices = Vec::with_capacity(data.len() / BODY_SLICE + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + BODY_SLICE).min(data.len());
        slices.push(data.slice(offset..end));
        offset = end;
    }

    let mut sent = 0u64;
    let stream = futures_util::stream::iter(slices.into_iter().map(move |slice| {
        sent += slice.len() as u64;
        progress(sent, total);
        Ok::<Bytes, std::io::Error>(slice)
    }));
    reqwest::Body::wrap_stream(stream)
}

impl UploadEndpoint for HttpEndpoint {
    fn skip_check(&self, query: SkipCheckQuery) -> EndpointFuture<'_, ChunkResult> {
        Box::pin(async move { Ok(self.fetch_skip_check(query).await?) })
    }

    fn upload_chunk(
        &self,
        upload: ChunkUpload,
        progress: ProgressFn,
    ) -> EndpointFuture<'_, ApiResult> {
        Box::pin(async move { Ok(self.send_chunk(upload, progress).await?) })
    }

    fn delete_chunks(&self, query: DeleteChunkQuery) -> EndpointFuture<'_, ()> {
        Box::pin(async move { Ok(self.send_delete(query).await?) })
    }

    fn merge(
        &self,
        info: UploadedFileInfo,
        upload_folder_path: String,
    ) -> EndpointFuture<'_, Option<ApiResult>> {
        Box::pin(async move { Ok(self.send_merge(info, upload_folder_path).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkup_protocol::ChunkUploadForm;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one full HTTP request (headers plus body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let headers = text[..header_end].to_ascii_lowercase();
            let body_len = buf.len() - (header_end + 4);
            if let Some(line) = headers.lines().find(|l| l.starts_with("content-length:")) {
                let want: usize = line["content-length:".len()..].trim().parse().unwrap();
                if body_len >= want {
                    break;
                }
            } else if headers.contains("transfer-encoding: chunked") {
                if text.ends_with("0\r\n\r\n") {
                    break;
                }
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Starts a one-shot mock server; the handle yields the raw request.
    async fn mock_server(status: u16, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return String::new();
            };
            let request = read_request(&mut stream).await;
            let resp = format!(
                "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
            request
        });

        (url, handle)
    }

    fn endpoint(url: &str) -> HttpEndpoint {
        let mut config = UploaderConfig::default();
        config.endpoint.base_url = url.to_string();
        config
            .endpoint
            .headers
            .insert("X-Upload-Token".into(), "secret".into());
        HttpEndpoint::new(&config).unwrap()
    }

    fn skip_query() -> SkipCheckQuery {
        SkipCheckQuery {
            fingerprint: "abc123".into(),
            filename: "a.bin".into(),
            upload_folder_path: "/".into(),
        }
    }

    #[tokio::test]
    async fn skip_check_parses_chunk_result() {
        let json = r#"{"success":true,"code":20000,"message":"","data":{"chunkResult":{"skipUpload":false,"uploadedChunkList":[1,2]}}}"#;
        let (url, handle) = mock_server(200, json).await;

        let result = endpoint(&url).skip_check(skip_query()).await.unwrap();
        assert!(!result.skip_upload);
        assert_eq!(result.uploaded_chunk_list, vec![1, 2]);

        let request = handle.await.unwrap();
        let first_line = request.lines().next().unwrap();
        assert!(first_line.starts_with("GET /fileUpload/chunk?"));
        assert!(first_line.contains("identifier=abc123"));
        assert!(first_line.contains("filename=a.bin"));
        assert!(first_line.contains("uploadFolderPath=%2F"));
        assert!(request.to_ascii_lowercase().contains("x-upload-token: secret"));
    }

    #[tokio::test]
    async fn skip_check_without_data_is_fresh_upload() {
        let (url, handle) = mock_server(200, r#"{"code":20000}"#).await;
        let result = endpoint(&url).skip_check(skip_query()).await.unwrap();
        assert_eq!(result, ChunkResult::default());
        handle.abort();
    }

    #[tokio::test]
    async fn skip_check_application_error() {
        let (url, handle) = mock_server(200, r#"{"code":50014,"message":"token expired"}"#).await;
        let err = endpoint(&url).skip_check(skip_query()).await.unwrap_err();
        assert!(matches!(err, TransferError::Application { code: 50014, .. }));
        handle.abort();
    }

    #[tokio::test]
    async fn http_error_status_is_network_error() {
        let (url, handle) = mock_server(500, "boom").await;
        let err = endpoint(&url).skip_check(skip_query()).await.unwrap_err();
        assert!(matches!(&err, TransferError::Network(m) if m == "HTTP 500: boom"));
        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = endpoint(&format!("http://127.0.0.1:{port}"))
            .skip_check(skip_query())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
    }

    #[tokio::test]
    async fn upload_chunk_sends_multipart_and_reports_progress() {
        let (url, handle) = mock_server(200, r#"{"success":true,"code":20000}"#).await;
        let data = Bytes::from(vec![b'x'; 100_000]);
        let upload = ChunkUpload {
            form: ChunkUploadForm {
                chunk_number: 2,
                chunk_size: 100_000,
                current_chunk_size: 100_000,
                total_size: 250_000,
                fingerprint: "abc123".into(),
                filename: "a.bin".into(),
                relative_path: "dir/a.bin".into(),
                total_chunks: 3,
            },
            data,
            filename: "a.bin".into(),
            content_type: "application/octet-stream".into(),
            upload_folder_path: "/videos".into(),
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |sent, total| seen.lock().unwrap().push((sent, total)))
        };

        let result = endpoint(&url).upload_chunk(upload, progress).await.unwrap();
        assert_eq!(result.code, 20000);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&(100_000, 100_000)));
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /fileUpload/chunk?uploadFolderPath=%2Fvideos"));
        assert!(request.contains("multipart/form-data"));
        assert!(request.contains("name=\"chunkNumber\"\r\n\r\n2"));
        assert!(request.contains("name=\"identifier\"\r\n\r\nabc123"));
        assert!(request.contains("name=\"relativePath\"\r\n\r\ndir/a.bin"));
        assert!(request.contains("name=\"totalChunks\"\r\n\r\n3"));
        assert!(request.contains("name=\"multipartFile\"; filename=\"a.bin\""));
    }

    #[tokio::test]
    async fn upload_chunk_returns_application_code_untouched() {
        let (url, handle) = mock_server(200, r#"{"code":20001,"message":"upload failed"}"#).await;
        let upload = ChunkUpload {
            form: ChunkUploadForm {
                chunk_number: 1,
                chunk_size: 4,
                current_chunk_size: 4,
                total_size: 4,
                fingerprint: "fp".into(),
                filename: "a.bin".into(),
                relative_path: "a.bin".into(),
                total_chunks: 1,
            },
            data: Bytes::from_static(b"abcd"),
            filename: "a.bin".into(),
            content_type: "application/octet-stream".into(),
            upload_folder_path: "/".into(),
        };
        let result = endpoint(&url)
            .upload_chunk(upload, Arc::new(|_: u64, _: u64| {}))
            .await
            .unwrap();
        assert_eq!(result.code, 20001);
        assert_eq!(result.message, "upload failed");
        handle.abort();
    }

    #[tokio::test]
    async fn delete_sends_identifier() {
        let (url, handle) = mock_server(200, r#"{"code":20000}"#).await;
        endpoint(&url)
            .delete_chunks(DeleteChunkQuery {
                fingerprint: "abc123".into(),
                upload_folder_path: "/".into(),
            })
            .await
            .unwrap();

        let request = handle.await.unwrap();
        assert!(
            request.starts_with("DELETE /fileUpload/chunk?identifier=abc123&uploadFolderPath=%2F")
        );
    }

    #[tokio::test]
    async fn merge_posts_file_info() {
        let (url, handle) = mock_server(200, r#"{"success":true,"code":20000}"#).await;
        let info = UploadedFileInfo {
            name: "a.bin".into(),
            size: 10,
            file_type: "application/octet-stream".into(),
            relative_path: "a.bin".into(),
            unique_identifier: "abc123".into(),
        };

        let result = endpoint(&url).merge(info, "/".into()).await.unwrap();
        assert_eq!(result.unwrap().code, 20000);

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /fileUpload/mergeFile?uploadFolderPath=%2F"));
        assert!(request.contains("\"uniqueIdentifier\":\"abc123\""));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn merge_with_binary_body_has_no_envelope() {
        let (url, handle) = mock_server(200, "PK\u{3}\u{4}").await;
        let info = UploadedFileInfo {
            name: "a.zip".into(),
            size: 4,
            file_type: String::new(),
            relative_path: String::new(),
            unique_identifier: "fp".into(),
        };
        let result = endpoint(&url).merge(info, "/".into()).await.unwrap();
        assert!(result.is_none());
        handle.abort();
    }

    #[test]
    fn invalid_header_rejected() {
        let mut config = UploaderConfig::default();
        config.endpoint.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            HttpEndpoint::new(&config),
            Err(UploadError::Config(_))
        ));
    }

    #[test]
    fn url_join_trims_slash() {
        let mut config = UploaderConfig::default();
        config.endpoint.base_url = "http://host:1/api/".into();
        let ep = HttpEndpoint::new(&config).unwrap();
        assert_eq!(ep.url("/fileUpload/chunk"), "http://host:1/api/fileUpload/chunk");
    }
}
