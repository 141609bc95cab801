//! Cloud notebook service client.
//!
//! The queue talks to the service only through [`NotebookClient`]; the Graph
//! implementation below is the production one. Token acquisition and refresh
//! live outside this crate and are plugged in through [`TokenSource`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0/me/onenote";

const HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cloud service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("no access token available")]
    Unauthenticated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A page ready to upload: the raw file as an attachment plus an HTML
/// metadata panel.
#[derive(Debug, Clone)]
pub struct PageUpload {
    pub title: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub metadata: PageMetadata,
}

/// Provenance shown on every imported page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMetadata {
    pub virtual_path: String,
    pub document_id: String,
    pub page_number: Option<u32>,
    pub imported_at: String,
}

impl PageUpload {
    /// Page body: title, metadata table and a link to the attachment part.
    pub fn render_html(&self) -> String {
        let m = &self.metadata;
        let page_number = m
            .page_number
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<title>{title}</title>\n</head>\n<body>\n\
             <table border=\"1\">\n\
             <tr><td>Source path</td><td>{path}</td></tr>\n\
             <tr><td>Document ID</td><td>{doc}</td></tr>\n\
             <tr><td>Page</td><td>{page_number}</td></tr>\n\
             <tr><td>Imported</td><td>{imported}</td></tr>\n\
             </table>\n\
             <object data-attachment=\"{file}\" data=\"name:{part}\" type=\"{ctype}\" />\n\
             </body>\n</html>",
            title = escape_html(&self.title),
            path = escape_html(&m.virtual_path),
            doc = escape_html(&m.document_id),
            imported = escape_html(&m.imported_at),
            file = escape_html(&self.filename),
            part = ATTACHMENT_PART,
            ctype = escape_html(&self.content_type),
        )
    }
}

const ATTACHMENT_PART: &str = "pagefile";

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Content type for an uploaded page file, by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Hierarchical notebook -> section -> page operations.
///
/// The find/create pairs are not atomic on the service side; callers must
/// not race two get-or-create sequences for the same name.
#[async_trait]
pub trait NotebookClient: Send + Sync {
    async fn find_notebook(&self, display_name: &str) -> Result<Option<String>, CloudError>;
    async fn create_notebook(&self, display_name: &str) -> Result<String, CloudError>;
    async fn find_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, CloudError>;
    async fn create_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<String, CloudError>;
    /// Returns the id of the created page.
    async fn upload_page(&self, section_id: &str, page: &PageUpload) -> Result<String, CloudError>;

    async fn get_or_create_notebook(&self, display_name: &str) -> Result<String, CloudError> {
        match self.find_notebook(display_name).await? {
            Some(id) => Ok(id),
            None => self.create_notebook(display_name).await,
        }
    }

    async fn get_or_create_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<String, CloudError> {
        match self.find_section(notebook_id, display_name).await? {
            Some(id) => Ok(id),
            None => self.create_section(notebook_id, display_name).await,
        }
    }
}

/// Supplies bearer tokens for the cloud service.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

#[derive(Deserialize)]
struct Collection {
    value: Vec<Entity>,
}

#[derive(Deserialize)]
struct Entity {
    id: String,
}

/// `NotebookClient` over the Microsoft Graph OneNote endpoints.
pub struct GraphNotebookClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl GraphNotebookClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("inkbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn token(&self) -> Result<String, CloudError> {
        self.tokens.access_token().ok_or(CloudError::Unauthenticated)
    }

    async fn first_id(&self, url: String) -> Result<Option<String>, CloudError> {
        let response = self.http.get(&url).bearer_auth(self.token()?).send().await?;
        let collection: Collection = decode(response).await?;
        Ok(collection.value.into_iter().next().map(|e| e.id))
    }

    async fn create(&self, url: String, display_name: &str) -> Result<String, CloudError> {
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.token()?)
            .json(&json!({ "displayName": display_name }))
            .send()
            .await?;
        let entity: Entity = decode(response).await?;
        debug!(url = %url, display_name, id = %entity.id, "created cloud container");
        Ok(entity.id)
    }
}

/// `$filter=displayName eq '<name>'`, with quotes doubled per OData.
fn display_name_filter(display_name: &str) -> String {
    let clause = format!("displayName eq '{}'", display_name.replace('\'', "''"));
    format!("$filter={}", urlencoding::encode(&clause))
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CloudError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CloudError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| CloudError::Decode(e.to_string()))
}

#[async_trait]
impl NotebookClient for GraphNotebookClient {
    async fn find_notebook(&self, display_name: &str) -> Result<Option<String>, CloudError> {
        let url = format!("{}/notebooks?{}", self.base_url, display_name_filter(display_name));
        self.first_id(url).await
    }

    async fn create_notebook(&self, display_name: &str) -> Result<String, CloudError> {
        self.create(format!("{}/notebooks", self.base_url), display_name)
            .await
    }

    async fn find_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, CloudError> {
        let url = format!(
            "{}/notebooks/{}/sections?{}",
            self.base_url,
            urlencoding::encode(notebook_id),
            display_name_filter(display_name)
        );
        self.first_id(url).await
    }

    async fn create_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<String, CloudError> {
        let url = format!(
            "{}/notebooks/{}/sections",
            self.base_url,
            urlencoding::encode(notebook_id)
        );
        self.create(url, display_name).await
    }

    async fn upload_page(&self, section_id: &str, page: &PageUpload) -> Result<String, CloudError> {
        let url = format!(
            "{}/sections/{}/pages",
            self.base_url,
            urlencoding::encode(section_id)
        );
        let presentation = Part::text(page.render_html()).mime_str("text/html")?;
        let attachment = Part::bytes(page.bytes.clone())
            .file_name(page.filename.clone())
            .mime_str(&page.content_type)?;
        let form = Form::new()
            .part("Presentation", presentation)
            .part(ATTACHMENT_PART, attachment);

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.token()?)
            .multipart(form)
            .send()
            .await?;
        let entity: Entity = decode(response).await?;
        Ok(entity.id)
    }
}
