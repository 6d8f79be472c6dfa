//! Source provider: where desired state comes from.

use async_trait::async_trait;
use fleetsync_core::{Secret, UnitId};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::types::{RemoteEntry, RemoteUnit, SearchQuery};

/// Query and content access to the remote source of deployment intent.
///
/// Not-found answers are `Ok(None)`, never errors.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RemoteUnit>>;

    /// Raw bytes of a file in the unit, `None` if absent.
    async fn file_content(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<u8>>>;

    /// Entries of a directory in the unit, `None` if absent.
    async fn list_directory(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<RemoteEntry>>>;
}

const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: usize = 100;
/// Search results stop at 1000 items.
const MAX_PAGES: usize = 10;

/// [`SourceProvider`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubSource {
    http: reqwest::Client,
    base: Url,
    token: Secret,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<RepoItem>,
}

#[derive(Deserialize)]
struct RepoItem {
    name: String,
    owner: RepoOwner,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct RepoOwner {
    login: String,
}

impl From<RepoItem> for RemoteUnit {
    fn from(item: RepoItem) -> Self {
        let metadata: Map<String, Value> = [
            ("html_url", item.html_url),
            ("default_branch", item.default_branch),
            ("description", item.description),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), Value::String(v))))
        .collect();

        Self {
            id: UnitId::new(item.owner.login, item.name),
            archived: item.archived,
            topics: item.topics,
            metadata,
        }
    }
}

impl GitHubSource {
    /// # Errors
    ///
    /// Fails if `api_url` is not an absolute http(s) URL.
    pub fn new(http: reqwest::Client, api_url: &str, token: Secret) -> Result<Self> {
        let base = Url::parse(api_url).map_err(|e| Error::source_failed("configure", e))?;
        if base.cannot_be_a_base() {
            return Err(Error::source_failed(
                "configure",
                format!("'{api_url}' cannot be used as a base URL"),
            ));
        }
        Ok(Self { http, base, token })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::source_failed("configure", "base URL has no path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn contents_url(&self, unit: &UnitId, path: &str) -> Result<Url> {
        self.endpoint(
            ["repos", unit.owner(), unit.name(), "contents"]
                .into_iter()
                .chain(path.split('/').filter(|s| !s.is_empty())),
        )
    }

    /// GET `url`; 404 becomes `None`, other failures become `Source` errors.
    async fn get(&self, operation: &str, url: Url, accept: &str) -> Result<Option<reqwest::Response>> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, accept)
            .header(USER_AGENT, concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
            .header(API_VERSION_HEADER, API_VERSION);
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", self.token.expose()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::source_failed(operation, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => {
                let body = response.text().await.unwrap_or_default();
                let body: String = body.chars().take(200).collect();
                Err(Error::source_failed(operation, format!("{status}: {body}")))
            }
        }
    }
}

#[async_trait]
impl SourceProvider for GitHubSource {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RemoteUnit>> {
        let rendered = query.to_string();
        let mut units = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut url = self.endpoint(["search", "repositories"])?;
            url.query_pairs_mut()
                .append_pair("q", &rendered)
                .append_pair("per_page", &PER_PAGE.to_string())
                .append_pair("page", &page.to_string());

            let Some(response) = self.get("search", url, JSON_MEDIA_TYPE).await? else {
                break;
            };
            let body: SearchPage = response
                .json()
                .await
                .map_err(|e| Error::source_failed("search", e))?;

            let count = body.items.len();
            units.extend(body.items.into_iter().map(RemoteUnit::from));
            if count < PER_PAGE {
                break;
            }
        }

        debug!(query = %rendered, results = units.len(), "Search complete");
        Ok(units)
    }

    async fn file_content(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<u8>>> {
        let url = self.contents_url(unit, path)?;
        match self.get("file content", url, RAW_MEDIA_TYPE).await? {
            Some(response) => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::source_failed("file content", e))?;
                Ok(Some(bytes.to_vec()))
            }
            None => Ok(None),
        }
    }

    async fn list_directory(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<RemoteEntry>>> {
        let url = self.contents_url(unit, path)?;
        let Some(response) = self.get("directory listing", url, JSON_MEDIA_TYPE).await? else {
            return Ok(None);
        };

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::source_failed("directory listing", e))?;
        match body {
            Value::Array(_) => serde_json::from_value(body)
                .map(Some)
                .map_err(|e| Error::source_failed("directory listing", e)),
            _ => Err(Error::source_failed(
                "directory listing",
                format!("'{path}' in {unit} is not a directory"),
            )),
        }
    }
}
