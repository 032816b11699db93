use percent_encoding::percent_decode_str;

use crate::mastodon::Timeline;

/// Views addressable by URL fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Public { local: bool },
    Home,
    Tag(String),
    /// Account by numeric id.
    Account(String),
    /// Account by `user@host` handle, resolved through a lookup first.
    AccountHandle(String),
    Settings,
    ChangeServer,
}

impl Route {
    pub fn parse(fragment: &str) -> Option<Route> {
        let path = fragment.trim().trim_start_matches('#');
        let route = match path.split_once('/') {
            None => match path {
                "" | "public" => Some(Route::Public { local: false }),
                "home" => Some(Route::Home),
                "settings" => Some(Route::Settings),
                "changeserver" => Some(Route::ChangeServer),
                _ => None,
            },
            Some(("public", "local")) => Some(Route::Public { local: true }),
            Some(("tags", tag)) if !tag.is_empty() => Some(Route::Tag(decode(tag))),
            Some(("accounts", id)) if id.starts_with('@') && id.len() > 1 => {
                Some(Route::AccountHandle(decode(&id[1..])))
            }
            Some(("accounts", id)) if !id.is_empty() && !id.starts_with('@') => {
                Some(Route::Account(decode(id)))
            }
            _ => None,
        };
        if route.is_none() {
            tracing::warn!(fragment = %fragment, "unrecognized route");
        }
        route
    }

    pub fn fragment(&self) -> String {
        match self {
            Route::Public { local: false } => "#public".into(),
            Route::Public { local: true } => "#public/local".into(),
            Route::Home => "#home".into(),
            Route::Tag(tag) => format!("#tags/{tag}"),
            Route::Account(id) => format!("#accounts/{id}"),
            Route::AccountHandle(handle) => format!("#accounts/@{handle}"),
            Route::Settings => "#settings".into(),
            Route::ChangeServer => "#changeserver".into(),
        }
    }

    /// Server timeline backing this route, for the routes that have one.
    pub fn timeline(&self) -> Option<Timeline> {
        match self {
            Route::Public { local } => Some(Timeline::Public { local: *local }),
            Route::Home => Some(Timeline::Home),
            Route::Tag(tag) => Some(Timeline::Tag(tag.clone())),
            _ => None,
        }
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Route::Home)
    }
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fragments() {
        assert_eq!(Route::parse("#public"), Some(Route::Public { local: false }));
        assert_eq!(Route::parse(""), Some(Route::Public { local: false }));
        assert_eq!(Route::parse("#public/local"), Some(Route::Public { local: true }));
        assert_eq!(Route::parse("#home"), Some(Route::Home));
        assert_eq!(Route::parse("#tags/caf%C3%A9"), Some(Route::Tag("café".into())));
        assert_eq!(Route::parse("#accounts/109"), Some(Route::Account("109".into())));
        assert_eq!(
            Route::parse("#accounts/@bob@example.social"),
            Some(Route::AccountHandle("bob@example.social".into()))
        );
        assert_eq!(Route::parse("settings"), Some(Route::Settings));
        assert_eq!(Route::parse("#changeserver"), Some(Route::ChangeServer));
    }

    #[test]
    fn rejects_unknown_fragments() {
        assert_eq!(Route::parse("#nowhere"), None);
        assert_eq!(Route::parse("#tags/"), None);
        assert_eq!(Route::parse("#public/federated"), None);
        assert_eq!(Route::parse("#accounts/@"), None);
    }

    #[test]
    fn timelines_for_routes() {
        assert_eq!(
            Route::Tag("rust".into()).timeline(),
            Some(Timeline::Tag("rust".into()))
        );
        assert_eq!(Route::Settings.timeline(), None);
        assert_eq!(Route::Account("1".into()).timeline(), None);
        assert_eq!(Route::Public { local: true }.fragment(), "#public/local");
    }
}
