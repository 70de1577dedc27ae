//! # Localized Messages
//!
//! Messages written onto a WebSocket after upgrade (farewells, error
//! texts) are localized per recipient. A small built-in catalog covers
//! `en` and `zh`; an optional TOML bundle can extend or override it:
//!
//! ```toml
//! [en]
//! session_end = "The session has ended"
//!
//! [fr]
//! session_end = "La session est terminée"
//! ```

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

/// Farewell sent to monitors when a session goes offline.
pub const MSG_SESSION_END: &str = "session_end";
/// Reason attached to the graphical disconnect instruction.
pub const MSG_CLOSED_BY_ADMIN: &str = "closed_by_admin";
/// Written before closing a socket bound to a dead session id.
pub const MSG_INVALID_SESSION: &str = "invalid_session";
/// Written before closing a socket the caller may not use.
pub const MSG_NO_PERMISSION: &str = "no_permission";
/// Written when the upstream connection attempt failed.
pub const MSG_CONNECT_FAILED: &str = "connect_failed";

type Bundle = HashMap<String, String>;

/// The message catalog plus the configured fallback language.
#[derive(Debug, Clone)]
pub struct Catalog {
    bundles: HashMap<String, Bundle>,
    default_lang: String,
}

fn builtin() -> HashMap<String, Bundle> {
    let en: Bundle = [
        (MSG_SESSION_END, "the session has ended"),
        (MSG_CLOSED_BY_ADMIN, "closed by admin"),
        (MSG_INVALID_SESSION, "invalid session id"),
        (MSG_NO_PERMISSION, "permission denied"),
        (MSG_CONNECT_FAILED, "failed to connect to the server"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let zh: Bundle = [
        (MSG_SESSION_END, "会话已结束"),
        (MSG_CLOSED_BY_ADMIN, "管理员已关闭会话"),
        (MSG_INVALID_SESSION, "无效的会话"),
        (MSG_NO_PERMISSION, "没有权限"),
        (MSG_CONNECT_FAILED, "连接服务器失败"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    HashMap::from([("en".to_string(), en), ("zh".to_string(), zh)])
}

impl Catalog {
    /// Builds the catalog from the built-in tables, overlaying `bundle`
    /// when it points at a readable TOML file.
    pub fn load(bundle: Option<&Path>, default_lang: &str) -> Self {
        let mut bundles = builtin();
        if let Some(path) = bundle {
            match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str::<HashMap<String, Bundle>>(&text) {
                    Ok(overlay) => {
                        for (lang, table) in overlay {
                            bundles.entry(lang).or_default().extend(table);
                        }
                    }
                    Err(e) => warn!("Ignoring malformed i18n bundle {}: {}", path.display(), e),
                },
                Err(e) => warn!("Cannot read i18n bundle {}: {}", path.display(), e),
            }
        }
        Self {
            bundles,
            default_lang: default_lang.to_string(),
        }
    }

    /// Looks up `key` for `lang`, falling back to the default language
    /// and finally to the key itself.
    pub fn lookup(&self, lang: &str, key: &str) -> String {
        self.bundles
            .get(lang)
            .and_then(|b| b.get(key))
            .or_else(|| {
                self.bundles
                    .get(self.default_lang.as_str())
                    .and_then(|b| b.get(key))
            })
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Resolves the language for one peer.
    ///
    /// An explicit `lang` query parameter wins; otherwise the first
    /// `Accept-Language` entry whose primary subtag has a bundle is
    /// used; otherwise the configured default.
    pub fn resolve_lang(&self, query_lang: Option<&str>, accept_language: Option<&str>) -> String {
        if let Some(lang) = query_lang {
            let lang = lang.trim();
            if !lang.is_empty() {
                return lang.to_string();
            }
        }
        if let Some(header) = accept_language {
            for entry in header.split(',') {
                let tag = entry.split(';').next().unwrap_or("").trim();
                let primary = tag.split('-').next().unwrap_or("").to_ascii_lowercase();
                if self.bundles.contains_key(primary.as_str()) {
                    return primary;
                }
            }
        }
        self.default_lang.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> Catalog {
        Catalog::load(None, "en")
    }

    #[test]
    fn lookup_prefers_the_requested_language() {
        assert_eq!(catalog().lookup("zh", MSG_SESSION_END), "会话已结束");
    }

    #[test]
    fn lookup_falls_back_to_default_then_key() {
        let c = catalog();
        assert_eq!(c.lookup("fr", MSG_SESSION_END), "the session has ended");
        assert_eq!(c.lookup("en", "no_such_key"), "no_such_key");
    }

    #[test]
    fn resolve_lang_prefers_explicit_query() {
        let c = catalog();
        assert_eq!(c.resolve_lang(Some("zh"), Some("en-US,en;q=0.9")), "zh");
    }

    #[test]
    fn resolve_lang_walks_accept_language() {
        let c = catalog();
        assert_eq!(c.resolve_lang(None, Some("fr-FR,zh-CN;q=0.8")), "zh");
        assert_eq!(c.resolve_lang(None, Some("fr-FR,fr;q=0.9")), "en");
        assert_eq!(c.resolve_lang(None, None), "en");
    }

    #[test]
    fn bundle_file_overlays_builtin_messages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[en]\nsession_end = \"bye now\"\n\n[fr]\nsession_end = \"au revoir\"")
            .unwrap();
        let c = Catalog::load(Some(file.path()), "en");
        assert_eq!(c.lookup("en", MSG_SESSION_END), "bye now");
        assert_eq!(c.lookup("fr", MSG_SESSION_END), "au revoir");
        // Untouched keys keep their built-in text.
        assert_eq!(c.lookup("en", MSG_NO_PERMISSION), "permission denied");
    }
}
