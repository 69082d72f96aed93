//! Remote object store collaborator and its HTTP implementation

use crate::config::RemoteConfig;
use crate::error::{MirrorError, Result};
use crate::multipart::MultipartBody;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// A cloud object store with one app-private folder per account.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Identifier of the object called `name` inside `folder`, if any
    async fn find_object(&self, token: &str, name: &str, folder: &str) -> Result<Option<String>>;

    /// Create an object from a multipart body and return its identifier
    async fn create_object(&self, token: &str, body: MultipartBody) -> Result<String>;

    /// Overwrite the object `id` with a multipart body
    async fn update_object(&self, token: &str, id: &str, body: MultipartBody) -> Result<()>;

    /// Raw content of the object `id`
    async fn fetch_object(&self, token: &str, id: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
}

/// Drive-v3-shaped object store over HTTPS
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Quote a name for use inside a `q=name='...'` search expression.
fn quote_name(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(MirrorError::NotAuthorized);
    }
    Err(MirrorError::Remote {
        status: status.as_u16(),
        message: response.text().await.unwrap_or_default(),
    })
}

#[async_trait]
impl RemoteObjectStore for HttpObjectStore {
    async fn find_object(&self, token: &str, name: &str, folder: &str) -> Result<Option<String>> {
        let url = format!("{}/drive/v3/files", self.base_url);
        let query = format!("name='{}' and trashed=false", quote_name(name));

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("spaces", folder), ("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await?;

        let list: FileList = check(response).await?.json().await?;
        if list.files.len() > 1 {
            debug!("{} objects named {}; using the first", list.files.len(), name);
        }
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_object(&self, token: &str, body: MultipartBody) -> Result<String> {
        let url = format!("{}/upload/drive/v3/files", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(CONTENT_TYPE, body.content_type())
            .body(body.bytes)
            .send()
            .await?;

        let created: FileEntry = check(response).await?.json().await?;
        debug!("Created remote object {}", created.id);
        Ok(created.id)
    }

    async fn update_object(&self, token: &str, id: &str, body: MultipartBody) -> Result<()> {
        let url = format!("{}/upload/drive/v3/files/{}", self.base_url, id);

        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "multipart")])
            .header(CONTENT_TYPE, body.content_type())
            .body(body.bytes)
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    async fn fetch_object(&self, token: &str, id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/drive/v3/files/{}", self.base_url, id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await?;

        let bytes = check(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_name() {
        assert_eq!(quote_name("backup.json"), "backup.json");
        assert_eq!(quote_name("it's"), "it\\'s");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = RemoteConfig {
            api_base_url: "http://127.0.0.1:9/".into(),
            ..RemoteConfig::default()
        };
        let store = HttpObjectStore::new(&config).unwrap();
        assert_eq!(store.base_url(), "http://127.0.0.1:9");
    }
}
