use askama::Template;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};

use crate::mastodon::{Account, Attachment, AttachmentKind, Card, CardKind, Interaction, Status};

static ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<a\s([^>]*)>(.*?)</a>"#).expect("anchor pattern"));
static HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"href="([^"]*)""#).expect("href pattern"));
static CLASS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"class="([^"]*)""#).expect("class pattern"));
static TAG_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*/tags/(.+)$").expect("tag pattern"));
static MENTION_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://(.+)/@(.+)$").expect("mention pattern"));

const AVATAR_SIZE: u32 = 48;

// --- Templates ---

#[derive(Template)]
#[template(path = "components/favicon.html")]
struct FaviconTemplate<'a> {
    host: &'a str,
    size: u32,
}

#[derive(Template)]
#[template(path = "components/date.html")]
struct DateTemplate {
    datetime: String,
    relative: String,
}

#[derive(Template)]
#[template(path = "components/account.html")]
struct AccountTemplate<'a> {
    id: &'a str,
    username: &'a str,
    avatar: &'a str,
    server: String,
    display_name: &'a str,
    favicon: String,
    size: u32,
    boosted: bool,
}

#[derive(Template)]
#[template(path = "components/attachment.html")]
struct AttachmentTemplate<'a> {
    url: &'a str,
    preview: &'a str,
    description: &'a str,
    width: u32,
    height: u32,
    sensitive: bool,
}

#[derive(Template)]
#[template(path = "components/card.html")]
struct CardTemplate<'a> {
    url: &'a str,
    title: &'a str,
    description: &'a str,
    image: Option<&'a str>,
    width: u32,
    height: u32,
}

#[derive(Template)]
#[template(path = "components/body.html")]
struct BodyTemplate<'a> {
    spoiler_text: &'a str,
    card: String,
    content: String,
    date: String,
    media: Vec<String>,
}

struct Toggle {
    action: &'static str,
    pressed: bool,
    label: &'static str,
}

#[derive(Template)]
#[template(path = "components/controls.html")]
struct ControlsTemplate<'a> {
    status_id: &'a str,
    toggles: Vec<Toggle>,
}

#[derive(Template)]
#[template(path = "components/post.html")]
struct PostTemplate<'a> {
    id: &'a str,
    reply: bool,
    ancestors: Vec<String>,
    account: String,
    body: String,
    controls: Option<String>,
}

#[derive(Template)]
#[template(path = "components/boost.html")]
struct BoostTemplate {
    booster: String,
    post: String,
}

/// Render a template to a string. A failure is logged and yields an empty
/// string so one broken post does not take the page down.
pub(crate) fn render(template: &impl Template) -> String {
    template.render().unwrap_or_else(|err| {
        tracing::error!(error = %err, "template render error");
        String::new()
    })
}

/// One rendered post of a reply chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub status_id: String,
    pub html: String,
}

/// Turns statuses into HTML. Holds an optional fixed clock so relative
/// timestamps are reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer {
    now: Option<DateTime<Utc>>,
    show_controls: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Some(now),
            show_controls: false,
        }
    }

    /// Render favourite/boost/bookmark toggles on top-level posts.
    pub fn with_controls(mut self, controls: bool) -> Self {
        self.show_controls = controls;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn relative_time(&self, created_at: DateTime<Utc>) -> String {
        let ms = (self.now() - created_at).num_milliseconds().max(0);
        if ms < 1500 {
            return format!("{ms} ms");
        }
        let seconds = (ms as f64 / 1000.0).round();
        if seconds < 90.0 {
            return format!("{seconds}s");
        }
        let minutes = (seconds / 60.0).round();
        if minutes < 90.0 {
            return format!("{minutes}min");
        }
        let hours = (minutes / 60.0).round();
        if hours < 90.0 {
            return format!("{hours}h");
        }
        let days = (hours / 24.0).round();
        format!("{days}d")
    }

    pub fn date(&self, created_at: DateTime<Utc>) -> String {
        render(&DateTemplate {
            datetime: created_at.to_rfc3339(),
            relative: self.relative_time(created_at),
        })
    }

    fn account_header(&self, account: &Account, boosted: bool) -> String {
        let server = account.server();
        render(&AccountTemplate {
            id: &account.id,
            username: &account.username,
            avatar: &account.avatar,
            favicon: favicon(&server),
            server,
            display_name: &account.display_name,
            size: AVATAR_SIZE,
            boosted,
        })
    }

    pub fn account(&self, account: &Account) -> String {
        self.account_header(account, false)
    }

    pub fn attachment(&self, attachment: &Attachment, sensitive: bool) -> Option<String> {
        let size = attachment.meta.as_ref().and_then(|meta| meta.small)?;
        match &attachment.kind {
            AttachmentKind::Image | AttachmentKind::Video | AttachmentKind::Gifv => {}
            other => {
                tracing::warn!(
                    kind = %String::from(other.clone()),
                    attachment = %attachment.id,
                    "unrecognized media attachment type"
                );
                return None;
            }
        }
        Some(render(&AttachmentTemplate {
            url: &attachment.url,
            preview: attachment.preview_url.as_deref().unwrap_or(&attachment.url),
            description: attachment.description.as_deref().unwrap_or_default(),
            width: size.width,
            height: size.height,
            sensitive,
        }))
    }

    pub fn card(&self, card: &Card) -> Option<String> {
        match card.kind {
            CardKind::Link | CardKind::Video => {}
            _ => return None,
        }
        Some(render(&CardTemplate {
            url: &card.url,
            title: &card.title,
            description: &card.description,
            image: card.image.as_deref(),
            width: card.width,
            height: card.height,
        }))
    }

    /// Content, card, timestamp and media, behind a disclosure when the
    /// author attached a content warning.
    pub fn body(&self, status: &Status) -> String {
        render(&BodyTemplate {
            spoiler_text: &status.spoiler_text,
            card: status
                .card
                .as_ref()
                .and_then(|card| self.card(card))
                .unwrap_or_default(),
            content: rewrite_links(&status.content),
            date: self.date(status.created_at),
            media: status
                .media_attachments
                .iter()
                .filter_map(|attachment| self.attachment(attachment, status.sensitive))
                .collect(),
        })
    }

    pub fn controls(&self, status: &Status) -> String {
        let toggle = |kind: Interaction, label: &'static str| {
            let pressed = status.interaction(kind);
            Toggle {
                action: kind.command(!pressed),
                pressed,
                label,
            }
        };
        render(&ControlsTemplate {
            status_id: &status.id,
            toggles: vec![
                toggle(Interaction::Favourite, "⭐"),
                toggle(Interaction::Reblog, "♻️"),
                toggle(Interaction::Bookmark, "🔖"),
            ],
        })
    }

    /// A top-level timeline entry. `ancestors` are the already-resolved
    /// fragments of the reply chain, root first.
    pub fn post(&self, status: &Status, ancestors: &[String]) -> String {
        if let Some(boosted) = &status.reblog {
            return render(&BoostTemplate {
                booster: self.account_header(&status.account, true),
                post: self.post(boosted, ancestors),
            });
        }
        render(&PostTemplate {
            id: &status.id,
            reply: status.is_reply(),
            ancestors: ancestors.to_vec(),
            account: self.account(&status.account),
            body: self.body(status),
            controls: self.show_controls.then(|| self.controls(status)),
        })
    }

    /// A post shown inside a reply chain. The author header is repeated only
    /// when the post answers someone else.
    pub fn fragment(&self, status: &Status) -> Fragment {
        let mut html = String::new();
        if !status
            .account
            .same_id(status.in_reply_to_account_id.as_deref())
        {
            html.push_str(&self.account(&status.account));
        }
        html.push_str(&self.body(status));
        Fragment {
            status_id: status.id.clone(),
            html,
        }
    }
}

pub fn favicon(host: &str) -> String {
    render(&FaviconTemplate {
        host,
        size: AVATAR_SIZE,
    })
}

/// Point hashtag links at the local tag route and show mentions with their
/// home server. Captured values come from server markup and are already
/// entity-encoded, so they are spliced in unchanged.
pub fn rewrite_links(content: &str) -> String {
    ANCHOR
        .replace_all(content, |caps: &Captures<'_>| {
            let mut attrs = caps[1].to_string();
            let mut inner = caps[2].to_string();
            let classes = CLASS
                .captures(&attrs)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let href = HREF
                .captures(&attrs)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let has_class = |name: &str| classes.split_whitespace().any(|c| c == name);

            if has_class("hashtag") {
                if let Some(tag) = TAG_HREF.captures(&href) {
                    let replacement = format!("href=\"#tags/{}\"", &tag[1]);
                    attrs = HREF.replace(&attrs, NoExpand(&replacement)).into_owned();
                }
            }
            if has_class("u-url") {
                if let Some(mention) = MENTION_HREF.captures(&href) {
                    let server = &mention[1];
                    inner = format!("@{}<sub>@{server}{}</sub>", &mention[2], favicon(server));
                }
            }
            format!("<a {attrs}>{inner}</a>")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastodon::fixtures;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn status(value: serde_json::Value) -> Status {
        Status::from_value(value).unwrap()
    }

    #[test]
    fn relative_time_thresholds() {
        let r = Renderer::at(clock());
        assert_eq!(r.relative_time(clock() - Duration::milliseconds(200)), "200 ms");
        assert_eq!(r.relative_time(clock() - Duration::seconds(45)), "45s");
        assert_eq!(r.relative_time(clock() - Duration::minutes(30)), "30min");
        assert_eq!(r.relative_time(clock() - Duration::hours(5)), "5h");
        assert_eq!(r.relative_time(clock() - Duration::days(10)), "10d");
        assert_eq!(r.relative_time(clock() + Duration::seconds(5)), "0 ms");
    }

    #[test]
    fn plain_post_has_no_disclosure() {
        let post = status(fixtures::status("1", "hi", None));
        let html = Renderer::at(clock()).post(&post, &[]);
        assert!(html.contains("hi"));
        assert!(!html.contains("<details"));
        assert!(html.contains("href=\"#accounts/a1\""));
        assert!(html.contains("@example.social"));
        assert!(html.contains("https://example.social/favicon.ico"));
    }

    #[test]
    fn content_warning_wraps_body() {
        let mut value = fixtures::status("2", "secret", Some("1"));
        value["spoiler_text"] = json!("cw");
        let post = status(value);
        let html = Renderer::at(clock()).body(&post);
        assert!(html.starts_with("<details><summary>cw</summary><section>secret"));
    }

    #[test]
    fn boost_renders_nested_original() {
        let mut value = fixtures::status("10", "", None);
        value["account"] = fixtures::account("b2", "booster");
        value["reblog"] = fixtures::status("11", "<p>original words</p>", None);
        let post = status(value);
        let html = Renderer::at(clock()).post(&post, &[]);
        assert!(html.contains("♻️"));
        assert!(html.contains("@booster"));
        assert!(html.contains("<article id=\"status-11\">"));
        assert!(html.contains("original words"));
        assert!(!html.contains("status-10"));
    }

    #[test]
    fn reply_gets_thread_slot_with_ancestors() {
        let post = status(fixtures::status("3", "child", Some("2")));
        let ancestors = vec!["<div>root</div>".to_string(), "<div>middle</div>".to_string()];
        let html = Renderer::at(clock()).post(&post, &ancestors);
        let slot = html.find("<summary>🧵</summary>").unwrap();
        let root = html.find("root").unwrap();
        let middle = html.find("middle").unwrap();
        let child = html.find("child").unwrap();
        assert!(slot < root && root < middle && middle < child);
    }

    #[test]
    fn self_reply_fragment_skips_header() {
        let mut value = fixtures::status("4", "more", Some("3"));
        value["in_reply_to_account_id"] = json!("a1");
        let fragment = Renderer::at(clock()).fragment(&status(value));
        assert!(!fragment.html.contains("#accounts/a1"));

        let other = status(fixtures::status("5", "answer", Some("3")));
        let fragment = Renderer::at(clock()).fragment(&other);
        assert!(fragment.html.contains("#accounts/a1"));
    }

    #[test]
    fn attachments_by_kind() {
        let r = Renderer::at(clock());
        let image: Attachment = serde_json::from_value(json!({
            "id": "m1",
            "type": "image",
            "url": "https://files.example/full.png",
            "preview_url": "https://files.example/small.png",
            "description": "a cat",
            "meta": {"small": {"width": 400, "height": 300}},
        }))
        .unwrap();
        let html = r.attachment(&image, false).unwrap();
        assert!(html.starts_with("<figure><a href=\"https://files.example/full.png\">"));
        assert!(html.contains("width=\"400\""));
        assert!(html.contains("<figcaption>a cat</figcaption>"));

        let hidden = r.attachment(&image, true).unwrap();
        assert!(hidden.starts_with("<details><summary>⚠️🫣 a cat</summary><figure>"));

        let mut unknown = image.clone();
        unknown.kind = AttachmentKind::Unknown("hologram".into());
        assert!(r.attachment(&unknown, false).is_none());

        let mut no_meta = image;
        no_meta.meta = None;
        assert!(r.attachment(&no_meta, false).is_none());
    }

    #[test]
    fn cards_render_links_only() {
        let r = Renderer::at(clock());
        let mut card: Card = serde_json::from_value(json!({
            "url": "https://example.org/a",
            "title": "Title",
            "description": "Summary",
            "type": "link",
            "image": "https://example.org/a.png",
            "width": 120,
            "height": 80,
        }))
        .unwrap();
        let html = r.card(&card).unwrap();
        assert!(html.starts_with("<aside><a href=\"https://example.org/a\""));
        assert!(html.contains("<p>Summary</p>"));

        card.kind = CardKind::Rich;
        assert!(r.card(&card).is_none());
    }

    #[test]
    fn links_are_rewritten() {
        let content = concat!(
            r#"<p><a href="https://mastodon.social/tags/rust" class="mention hashtag" rel="tag">#<span>rust</span></a> "#,
            r#"<span class="h-card"><a href="https://fosstodon.org/@bob" class="u-url mention">@<span>bob</span></a></span> "#,
            r#"<a href="https://example.org/">plain</a></p>"#,
        );
        let out = rewrite_links(content);
        assert!(out.contains(r##"href="#tags/rust""##));
        assert!(out.contains("@bob<sub>@fosstodon.org<img"));
        assert!(out.contains(r#"<a href="https://example.org/">plain</a>"#));
    }

    #[test]
    fn account_text_is_escaped() {
        let mut value = fixtures::status("7", "<p>kept</p>", None);
        value["account"]["display_name"] = json!("<b>Al & Co</b>");
        let html = Renderer::at(clock()).post(&status(value), &[]);
        assert!(html.contains("<em>&lt;b&gt;Al &amp; Co&lt;/b&gt;</em>"));
        assert!(html.contains("<p>kept</p>"));
    }

    #[test]
    fn encoded_mention_is_not_reencoded() {
        let content = r#"<a href="https://fosstodon.org/@b&amp;b" class="u-url mention">@<span>b&amp;b</span></a>"#;
        let out = rewrite_links(content);
        assert!(out.contains("@b&amp;b<sub>@fosstodon.org"));
        assert!(!out.contains("&amp;amp;"));
    }

    #[test]
    fn controls_reflect_flags() {
        let mut value = fixtures::status("6", "x", None);
        value["favourited"] = json!(true);
        let post = status(value);
        let html = Renderer::at(clock())
            .with_controls(true)
            .post(&post, &[]);
        assert!(html.contains(r#"data-action="unfavourite" data-status="6" aria-pressed="true""#));
        assert!(html.contains(r#"data-action="reblog" data-status="6" aria-pressed="false""#));
    }
}
