use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use url::Url;

use crate::storage::{self, ACCESS_TOKEN_KEY, CSS_KEY, SERVER_KEY, TOKEN_TYPE_KEY};

static HOSTNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+(:[0-9]{1,5})?$")
        .expect("hostname pattern compiles")
});

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no server hostname has been set")]
    NoHostname,
    #[error("invalid server hostname {0:?}")]
    InvalidHostname(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub token_type: String,
}

impl Credentials {
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Which navigation controls the page should offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavState {
    pub header: String,
    pub show_home: bool,
    pub show_login: bool,
}

#[derive(Debug, Default)]
struct State {
    hostname: Option<String>,
    credentials: Option<Credentials>,
    css_index: usize,
}

/// Hostname and bearer credentials for one server, mirrored to the store on
/// every change.
pub struct Session {
    store: Arc<storage::Store>,
    state: RwLock<State>,
}

impl Session {
    pub fn load(store: Arc<storage::Store>) -> Result<Self> {
        let hostname = store.get(SERVER_KEY)?.filter(|h| !h.trim().is_empty());
        let token = store.get(ACCESS_TOKEN_KEY)?;
        let token_type = store.get(TOKEN_TYPE_KEY)?;

        let credentials = match (token, token_type) {
            (Some(access_token), Some(token_type))
                if !access_token.is_empty() && !token_type.is_empty() =>
            {
                Some(Credentials {
                    access_token,
                    token_type,
                })
            }
            (None, None) => None,
            _ => {
                tracing::warn!("discarding incomplete stored credentials");
                store.remove(ACCESS_TOKEN_KEY)?;
                store.remove(TOKEN_TYPE_KEY)?;
                None
            }
        };

        let css_index = store
            .get(CSS_KEY)?
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(0);

        Ok(Self {
            store,
            state: RwLock::new(State {
                hostname,
                credentials,
                css_index,
            }),
        })
    }

    pub fn has_hostname(&self) -> bool {
        self.state.read().hostname.is_some()
    }

    pub fn hostname(&self) -> Option<String> {
        self.state.read().hostname.clone()
    }

    pub fn set_hostname(&self, name: &str) -> Result<()> {
        let name = normalize_hostname(name)?;
        self.store.set(SERVER_KEY, &name)?;
        tracing::debug!(hostname = %name, "server hostname set");
        self.state.write().hostname = Some(name);
        Ok(())
    }

    /// Forget the server together with any credentials issued by it.
    pub fn remove_hostname(&self) -> Result<()> {
        self.store.remove(SERVER_KEY)?;
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(TOKEN_TYPE_KEY)?;
        let mut state = self.state.write();
        state.hostname = None;
        state.credentials = None;
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().credentials.is_some()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.state.read().credentials.clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        self.store.set(ACCESS_TOKEN_KEY, &credentials.access_token)?;
        self.store.set(TOKEN_TYPE_KEY, &credentials.token_type)?;
        self.state.write().credentials = Some(credentials);
        Ok(())
    }

    /// Value for the `Authorization` header, present only when logged in.
    pub fn authorization(&self) -> Option<String> {
        self.state
            .read()
            .credentials
            .as_ref()
            .map(Credentials::authorization)
    }

    pub fn base_url(&self) -> Result<Url> {
        let hostname = self.hostname().ok_or(SessionError::NoHostname)?;
        Ok(Url::parse(&format!("https://{hostname}/"))?)
    }

    pub fn css_index(&self) -> usize {
        self.state.read().css_index
    }

    pub fn set_css_index(&self, index: usize) -> Result<()> {
        self.store.set(CSS_KEY, &index.to_string())?;
        self.state.write().css_index = index;
        Ok(())
    }

    pub fn nav(&self) -> NavState {
        let state = self.state.read();
        let logged_in = state.credentials.is_some();
        NavState {
            header: state
                .hostname
                .clone()
                .unwrap_or_else(|| "(no hostname)".to_string()),
            show_home: logged_in,
            show_login: !logged_in,
        }
    }
}

pub fn normalize_hostname(input: &str) -> Result<String, SessionError> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix("https://")
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_ascii_lowercase();
    if HOSTNAME_PATTERN.is_match(&stripped) {
        Ok(stripped)
    } else {
        Err(SessionError::InvalidHostname(trimmed.to_string()))
    }
}
