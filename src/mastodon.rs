use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::session::Session;

pub const DEFAULT_LIMIT: u32 = 40;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("mastodon: unauthorized")]
    Unauthorized,
    #[error("mastodon: not found")]
    NotFound,
    #[error("mastodon: rate limited: {0}")]
    RateLimited(String),
    #[error("mastodon: api error {status}: {body}")]
    Http { status: u16, body: String },
    /// The server answered with an `{"error": ...}` payload.
    #[error("{0}")]
    Server(String),
    #[error("mastodon: invalid payload: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Overrides the `https://{hostname}/` target derived from the session.
    pub base_url: Option<String>,
    pub http_client: Option<HttpClient>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub limit: Option<u32>,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            limit: Some(DEFAULT_LIMIT),
        }
    }
}

impl ListingOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self { limit: Some(limit) }
    }

    fn into_params(self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeline {
    Public { local: bool },
    Home,
    Tag(String),
}

impl Timeline {
    fn path(&self) -> String {
        match self {
            Timeline::Public { .. } => "/api/v1/timelines/public".into(),
            Timeline::Home => "/api/v1/timelines/home".into(),
            Timeline::Tag(tag) => format!("/api/v1/timelines/tag/{}", encode_segment(tag)),
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        match self {
            Timeline::Public { local: true } => vec![("local".into(), "true".into())],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Favourite,
    Reblog,
    Bookmark,
}

impl Interaction {
    pub fn command(&self, enabled: bool) -> &'static str {
        match (self, enabled) {
            (Interaction::Favourite, true) => "favourite",
            (Interaction::Favourite, false) => "unfavourite",
            (Interaction::Reblog, true) => "reblog",
            (Interaction::Reblog, false) => "unreblog",
            (Interaction::Bookmark, true) => "bookmark",
            (Interaction::Bookmark, false) => "unbookmark",
        }
    }
}

pub struct Client {
    session: Arc<Session>,
    http: HttpClient,
    user_agent: String,
    base_url: Option<Url>,
}

impl Client {
    pub fn new(session: Arc<Session>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("mastodon client user agent required");
        }
        let base_url = match config.base_url {
            Some(base) => Some(Url::parse(&base).context("mastodon: parse base url")?),
            None => None,
        };
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("mastodon: build http client")?,
        };

        Ok(Client {
            session,
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn timeline(&self, timeline: &Timeline, opts: ListingOptions) -> Result<Vec<Status>> {
        let mut params = timeline.params();
        params.extend(opts.into_params());
        let values: Vec<Value> = self.get_json(&timeline.path(), &params)?;
        values.into_iter().map(Status::from_value).collect()
    }

    pub fn account_timeline(&self, account_id: &str, opts: ListingOptions) -> Result<Vec<Status>> {
        let path = format!("/api/v1/accounts/{}/statuses", encode_segment(account_id));
        let values: Vec<Value> = self.get_json(&path, &opts.into_params())?;
        values.into_iter().map(Status::from_value).collect()
    }

    pub fn status(&self, id: &str) -> Result<Status> {
        let path = format!("/api/v1/statuses/{}", encode_segment(id));
        let value: Value = self.get_json(&path, &[])?;
        Status::from_value(value)
    }

    pub fn lookup_account(&self, acct: &str) -> Result<Account> {
        let acct = acct.trim_start_matches('@');
        let params = vec![("acct".to_string(), acct.to_string())];
        self.get_json("/api/v1/accounts/lookup", &params)
    }

    pub fn interact(&self, status_id: &str, kind: Interaction, enabled: bool) -> Result<()> {
        let path = format!(
            "/api/v1/statuses/{}/{}",
            encode_segment(status_id),
            kind.command(enabled)
        );
        self.request(Method::POST, &path, &[])?;
        Ok(())
    }

    pub fn favourite(&self, status_id: &str, enabled: bool) -> Result<()> {
        self.interact(status_id, Interaction::Favourite, enabled)
    }

    pub fn reblog(&self, status_id: &str, enabled: bool) -> Result<()> {
        self.interact(status_id, Interaction::Reblog, enabled)
    }

    pub fn bookmark(&self, status_id: &str, enabled: bool) -> Result<()> {
        self.interact(status_id, Interaction::Bookmark, enabled)
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(Method::GET, path, params)?;
        let value: Value = resp.json().context("mastodon: decode response body")?;
        if let Some(message) = error_message(&value) {
            bail!(ApiError::Server(message));
        }
        serde_json::from_value(value).with_context(|| format!("mastodon: unexpected payload from {path}"))
    }

    fn request(&self, method: Method, path: &str, params: &[(String, String)]) -> Result<Response> {
        let base = match &self.base_url {
            Some(url) => url.clone(),
            None => self.session.base_url()?,
        };
        let mut url = base.join(path)?;
        if !params.is_empty() {
            {
                let mut pairs = url.query_pairs_mut();
                for (k, v) in params {
                    pairs.append_pair(k, v);
                }
            }
        }

        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(auth) = self.session.authorization() {
            req = req.header(AUTHORIZATION, auth);
        }

        let resp = req.send().with_context(|| format!("mastodon: request {path}"))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| error_message(&v))
            .unwrap_or(body);
        let err = match status.as_u16() {
            401 => ApiError::Unauthorized,
            404 => ApiError::NotFound,
            429 => ApiError::RateLimited(detail),
            code => ApiError::Http { status: code, body: detail },
        };
        Err(err.into())
    }
}

fn error_message(value: &Value) -> Option<String> {
    value
        .as_object()
        .and_then(|obj| obj.get("error"))
        .map(|err| match err.as_str() {
            Some(text) => text.to_string(),
            None => err.to_string(),
        })
}

fn encode_segment(segment: &str) -> String {
    percent_encoding::utf8_percent_encode(segment, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub account: Account,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    #[serde(default)]
    pub in_reply_to_account_id: Option<String>,
    #[serde(default)]
    pub spoiler_text: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub media_attachments: Vec<Attachment>,
    #[serde(default)]
    pub card: Option<Card>,
    #[serde(default)]
    pub reblog: Option<Box<Status>>,
    #[serde(default)]
    pub favourited: Option<bool>,
    #[serde(default)]
    pub reblogged: Option<bool>,
    #[serde(default)]
    pub bookmarked: Option<bool>,
}

impl Status {
    /// Decode and validate a status as returned by the server.
    pub fn from_value(value: Value) -> Result<Self> {
        let status: Status =
            serde_json::from_value(value).context("mastodon: decode status")?;
        status.validate()?;
        Ok(status)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.id.trim().is_empty() {
            return Err(ApiError::Invalid("status without id".into()));
        }
        if self.account.id.trim().is_empty() {
            return Err(ApiError::Invalid(format!("status {} has no author id", self.id)));
        }
        if let Some(reblog) = &self.reblog {
            reblog.validate()?;
        }
        Ok(())
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to_id.is_some()
    }

    pub fn is_favourited(&self) -> bool {
        self.favourited.unwrap_or(false)
    }

    pub fn is_reblogged(&self) -> bool {
        self.reblogged.unwrap_or(false)
    }

    pub fn is_bookmarked(&self) -> bool {
        self.bookmarked.unwrap_or(false)
    }

    pub fn interaction(&self, kind: Interaction) -> bool {
        match kind {
            Interaction::Favourite => self.is_favourited(),
            Interaction::Reblog => self.is_reblogged(),
            Interaction::Bookmark => self.is_bookmarked(),
        }
    }

    pub fn set_interaction(&mut self, kind: Interaction, enabled: bool) {
        let flag = match kind {
            Interaction::Favourite => &mut self.favourited,
            Interaction::Reblog => &mut self.reblogged,
            Interaction::Bookmark => &mut self.bookmarked,
        };
        *flag = Some(enabled);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    pub url: Url,
}

impl Account {
    pub fn same_id(&self, id: Option<&str>) -> bool {
        id == Some(self.id.as_str())
    }

    /// Host of the account's home server, taken from its profile URL.
    pub fn server(&self) -> String {
        self.url.host_str().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttachmentKind {
    Image,
    Video,
    Gifv,
    Audio,
    Unknown(String),
}

impl From<String> for AttachmentKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "gifv" => AttachmentKind::Gifv,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::Unknown(value),
        }
    }
}

impl From<AttachmentKind> for String {
    fn from(kind: AttachmentKind) -> Self {
        match kind {
            AttachmentKind::Image => "image".into(),
            AttachmentKind::Video => "video".into(),
            AttachmentKind::Gifv => "gifv".into(),
            AttachmentKind::Audio => "audio".into(),
            AttachmentKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub meta: Option<AttachmentMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AttachmentMeta {
    #[serde(default)]
    pub small: Option<MediaSize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CardKind {
    Link,
    Photo,
    Video,
    Rich,
    Other(String),
}

impl From<String> for CardKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "link" => CardKind::Link,
            "photo" => CardKind::Photo,
            "video" => CardKind::Video,
            "rich" => CardKind::Rich,
            _ => CardKind::Other(value),
        }
    }
}

impl From<CardKind> for String {
    fn from(kind: CardKind) -> Self {
        match kind {
            CardKind::Link => "link".into(),
            CardKind::Photo => "photo".into(),
            CardKind::Video => "video".into(),
            CardKind::Rich => "rich".into(),
            CardKind::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CardKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn account(id: &str, username: &str) -> Value {
        json!({
            "id": id,
            "username": username,
            "acct": username,
            "display_name": format!("{username} display"),
            "avatar": format!("https://files.example/{username}.png"),
            "url": format!("https://example.social/@{username}"),
        })
    }

    pub fn status(id: &str, content: &str, parent: Option<&str>) -> Value {
        json!({
            "id": id,
            "account": account("a1", "alice"),
            "content": content,
            "created_at": "2024-05-01T12:00:00.000Z",
            "in_reply_to_id": parent,
            "in_reply_to_account_id": null,
            "spoiler_text": "",
            "media_attachments": [],
        })
    }
}
