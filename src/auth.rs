use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use askama::Template;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use tiny_http::{Header, Method, Request, Response, Server};
use url::Url;

use crate::config::ServerConfig;
use crate::render;
use crate::session::{Credentials, Session};

#[derive(Template)]
#[template(path = "pages/authorized.html")]
struct AuthorizedTemplate<'a> {
    server: &'a str,
}

pub struct Flow {
    cfg: ServerConfig,
    session: Arc<Session>,
    client: Client,
    /// Overrides the `https://{hostname}/` target derived from the session.
    base_url: Option<Url>,
}

/// A pending login: the URL to show the user and the loopback listener
/// waiting for the server to send them back.
pub struct AuthorizationRequest {
    pub browser_url: String,
    pub redirect_uri: String,
    state: String,
    code: Receiver<Result<String>>,
    stop: Sender<()>,
}

impl Drop for AuthorizationRequest {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}

/// What one request to the loopback listener amounts to.
#[derive(Debug, PartialEq, Eq)]
enum Callback {
    /// Not the redirect (favicon fetches, stray verbs); keep listening.
    Ignored(u16),
    Granted(String),
    Failed(u16, String),
}

impl Callback {
    fn parse(method: &Method, target: &str, state: &str) -> Self {
        if *method != Method::Get {
            return Callback::Ignored(405);
        }
        let Some((_, query)) = target.split_once('?') else {
            return Callback::Ignored(404);
        };
        let mut code = None;
        let mut returned_state = None;
        let mut error = None;
        let mut description = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => returned_state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }
        if returned_state.as_deref() != Some(state) {
            return Callback::Failed(400, "state mismatch".into());
        }
        if let Some(error) = error {
            let reason = match description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Callback::Failed(401, reason);
        }
        match code {
            Some(code) if !code.is_empty() => Callback::Granted(code),
            _ => Callback::Failed(400, "no code in redirect".into()),
        }
    }
}

impl Flow {
    pub fn new(session: Arc<Session>, cfg: ServerConfig, timeout: Duration) -> Result<Self> {
        if cfg.client_id.trim().is_empty() {
            bail!("auth: client id is required");
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("auth: build http client")?;

        Ok(Self {
            cfg,
            session,
            client,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = Some(Url::parse(base_url).context("auth: parse base url")?);
        Ok(self)
    }

    fn base(&self) -> Result<Url> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => self.session.base_url(),
        }
    }

    /// Start listening on the configured redirect address. Port 0 picks a
    /// free port; the returned URL carries the one actually bound.
    fn listen(&self) -> Result<(Server, Url)> {
        let mut redirect =
            Url::parse(&self.cfg.redirect_uri).context("auth: parse redirect uri")?;
        let host = redirect.host_str().unwrap_or("127.0.0.1").to_string();
        let port = redirect.port().unwrap_or(0);
        let server = Server::http((host.as_str(), port))
            .map_err(|err| anyhow!("auth: listen on {host}:{port}: {err}"))?;
        let bound = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("auth: listener has no ip address"))?;
        redirect
            .set_port(Some(bound.port()))
            .map_err(|_| anyhow!("auth: redirect uri cannot carry a port"))?;
        Ok((server, redirect))
    }

    /// Open the loopback listener and build the authorization URL that
    /// sends the user back to it.
    pub fn begin(&self) -> Result<AuthorizationRequest> {
        let (server, redirect) = self.listen()?;
        let state = random_string(32);
        let browser_url = self.authorize_url(redirect.as_str(), Some(&state))?;
        let server_name = self.session.hostname().unwrap_or_default();

        let (code_tx, code_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let expected = state.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                if stop_rx.try_recv().is_ok() {
                    return;
                }
                if let Some(outcome) = answer(request, &expected, &server_name) {
                    let _ = code_tx.send(outcome);
                    return;
                }
            }
        });

        tracing::debug!(redirect = %redirect, "waiting for authorization redirect");
        Ok(AuthorizationRequest {
            browser_url,
            redirect_uri: redirect.to_string(),
            state,
            code: code_rx,
            stop: stop_tx,
        })
    }

    pub fn authorize_url(&self, redirect_uri: &str, state: Option<&str>) -> Result<String> {
        let mut auth = self.base()?.join("/oauth/authorize")?;
        {
            let mut pairs = auth.query_pairs_mut();
            pairs
                .append_pair("force_login", "false")
                .append_pair("scope", &self.cfg.scopes.join(" "))
                .append_pair("client_id", &self.cfg.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("origin", &self.cfg.origin)
                .append_pair("response_type", "code")
                .append_pair("lang", &self.cfg.lang);
            if let Some(state) = state {
                pairs.append_pair("state", state);
            }
        }
        Ok(auth.to_string())
    }

    /// Block until the redirect arrives, then trade its code for a token.
    pub fn complete(&self, authz: AuthorizationRequest) -> Result<Credentials> {
        let code = authz
            .code
            .recv()
            .map_err(|_| anyhow!("auth: listener stopped before the redirect arrived"))??;
        self.login(&code, &authz.redirect_uri)
    }

    /// Exchange an authorization code for a token and keep it on the session.
    pub fn login(&self, code: &str, redirect_uri: &str) -> Result<Credentials> {
        let scope = self.cfg.scopes.join(" ");
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.cfg.client_id.as_str()),
            ("client_secret", self.cfg.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
        ];

        let token_url = self.base()?.join("/oauth/token")?;
        let resp = self
            .client
            .post(token_url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .context("auth: token request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            let reason = serde_json::from_str::<TokenError>(&body)
                .ok()
                .and_then(|err| err.reason())
                .unwrap_or(body);
            bail!("auth: server refused the code ({status}): {reason}");
        }

        let payload: TokenResponse = resp.json().context("auth: decode token response")?;
        if payload.access_token.is_empty() {
            bail!("auth: token response has no access_token");
        }
        let credentials = Credentials {
            access_token: payload.access_token,
            token_type: payload.token_type.unwrap_or_else(|| "Bearer".into()),
        };
        self.session.set_credentials(credentials.clone())?;
        tracing::info!("logged in");
        Ok(credentials)
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Respond to one listener request. Returns the login outcome once the
/// redirect has been seen, `None` while still waiting for it.
fn answer(request: Request, state: &str, server: &str) -> Option<Result<String>> {
    let callback = Callback::parse(request.method(), request.url(), state);
    let (response, outcome) = match callback {
        Callback::Ignored(code) => (Response::from_string("").with_status_code(code), None),
        Callback::Failed(code, reason) => (
            Response::from_string(reason.clone()).with_status_code(code),
            Some(Err(anyhow!("auth: {reason}"))),
        ),
        Callback::Granted(code) => {
            let page = render::render(&AuthorizedTemplate { server });
            let mut response = Response::from_string(page);
            if let Ok(header) = Header::from_bytes("Content-Type", "text/html; charset=utf-8") {
                response.add_header(header);
            }
            (response, Some(Ok(code)))
        }
    };
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "auth: failed to answer redirect");
    }
    outcome
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

/// OAuth error body, e.g. `{"error":"invalid_grant","error_description":"..."}`.
#[derive(Debug, Default, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenError {
    fn reason(self) -> Option<String> {
        let parts: Vec<String> = [self.error, self.error_description]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(": "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::storage::Store;
    use std::io::Read;

    fn session() -> Arc<Session> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = Arc::new(Session::load(store).unwrap());
        session.set_hostname("example.social").unwrap();
        session
    }

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            redirect_uri: "http://127.0.0.1:0/simplodon/callback".into(),
            ..ServerConfig::default()
        }
    }

    /// Serves one token response and hands back the form body it received.
    fn token_server(code: u16, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/", server.server_addr());
        let handle = thread::spawn(move || {
            let mut request = server.recv().unwrap();
            assert_eq!(request.url(), "/oauth/token");
            let mut form = String::new();
            request.as_reader().read_to_string(&mut form).unwrap();
            request
                .respond(Response::from_string(body).with_status_code(code))
                .unwrap();
            form
        });
        (base, handle)
    }

    #[test]
    fn authorize_url_carries_client_and_scope() {
        let flow = Flow::new(session(), ServerConfig::default(), Duration::from_secs(5)).unwrap();
        let url = flow
            .authorize_url("http://127.0.0.1:65011/simplodon/callback", Some("xyz"))
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("example.social"));
        assert_eq!(parsed.path(), "/oauth/authorize");
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["scope"], "read write follow");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], ServerConfig::default().client_id);
        assert_eq!(
            params["redirect_uri"],
            "http://127.0.0.1:65011/simplodon/callback"
        );
        assert_eq!(params["state"], "xyz");
        assert!(url.contains("scope=read+write+follow"));
    }

    #[test]
    fn authorize_url_requires_hostname() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = Arc::new(Session::load(store).unwrap());
        let flow = Flow::new(session, ServerConfig::default(), Duration::from_secs(5)).unwrap();
        assert!(flow.authorize_url("http://127.0.0.1/", None).is_err());
    }

    #[test]
    fn login_stores_credentials() {
        let (base, handle) = token_server(
            200,
            r#"{"access_token":"tok123","token_type":"Bearer","scope":"read write follow","created_at":1}"#,
        );
        let session = session();
        let flow = Flow::new(session.clone(), ServerConfig::default(), Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base)
            .unwrap();
        let credentials = flow.login("the-code", "http://127.0.0.1/cb").unwrap();
        assert_eq!(credentials.access_token, "tok123");
        assert!(session.is_logged_in());
        assert_eq!(session.authorization().as_deref(), Some("Bearer tok123"));

        let form = handle.join().unwrap();
        assert!(form.contains("grant_type=authorization_code"));
        assert!(form.contains("code=the-code"));
        assert!(form.contains("scope=read+write+follow"));
    }

    #[test]
    fn rejected_exchange_is_an_error() {
        let (base, handle) = token_server(
            400,
            r#"{"error":"invalid_grant","error_description":"The provided authorization grant is invalid"}"#,
        );
        let session = session();
        let flow = Flow::new(session.clone(), ServerConfig::default(), Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base)
            .unwrap();
        let err = flow.login("bad", "http://127.0.0.1/cb").unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
        assert!(!session.is_logged_in());
        handle.join().unwrap();
    }

    #[test]
    fn loopback_redirect_completes_login() {
        let (base, handle) = token_server(200, r#"{"access_token":"abc","token_type":"Bearer"}"#);
        let session = session();
        let flow = Flow::new(session.clone(), loopback_config(), Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base)
            .unwrap();
        let authz = flow.begin().unwrap();
        assert!(authz.browser_url.contains("state="));

        let callback = format!("{}?code=granted&state={}", authz.redirect_uri, authz.state);
        let page = Client::new().get(callback).send().unwrap();
        assert!(page.status().is_success());

        flow.complete(authz).unwrap();
        assert_eq!(session.authorization().as_deref(), Some("Bearer abc"));
        assert!(handle.join().unwrap().contains("code=granted"));
    }

    #[test]
    fn callback_outcomes() {
        let get = Method::Get;
        assert_eq!(Callback::parse(&get, "/favicon.ico", "s"), Callback::Ignored(404));
        assert_eq!(
            Callback::parse(&Method::Post, "/cb?code=c&state=s", "s"),
            Callback::Ignored(405)
        );
        assert_eq!(
            Callback::parse(&get, "/cb?code=c&state=s", "s"),
            Callback::Granted("c".into())
        );
        assert_eq!(
            Callback::parse(&get, "/cb?error=access_denied&error_description=no+thanks&state=s", "s"),
            Callback::Failed(401, "access_denied: no thanks".into())
        );
        assert_eq!(
            Callback::parse(&get, "/cb?state=s", "s"),
            Callback::Failed(400, "no code in redirect".into())
        );
    }

    #[test]
    fn token_error_reason() {
        let err: TokenError =
            serde_json::from_str(r#"{"error":"invalid_grant","error_description":"expired"}"#).unwrap();
        assert_eq!(err.reason().as_deref(), Some("invalid_grant: expired"));
        assert_eq!(TokenError::default().reason(), None);
    }

    #[test]
    fn state_mismatch_fails() {
        let flow = Flow::new(session(), loopback_config(), Duration::from_secs(5)).unwrap();
        let authz = flow.begin().unwrap();
        let callback = format!("{}?code=granted&state=forged", authz.redirect_uri);
        let page = Client::new().get(callback).send().unwrap();
        assert_eq!(page.status().as_u16(), 400);
        let err = flow.complete(authz).unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
    }
}
