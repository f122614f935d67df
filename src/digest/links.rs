//! Centralized deep-link construction and escaping.
//!
//! Every query parameter is URL-encoded here; rendering escapes the
//! final URL again for HTML-attribute context. Validation whitelists
//! links to the mail-provider host.

use url::Url;

#[derive(Clone)]
pub struct LinkBuilder {
    base: String,
}

impl LinkBuilder {
    pub fn new(base: String) -> Self {
        Self { base: base.trim_end_matches('/').to_string() }
    }

    pub fn base_host(&self) -> Option<String> {
        Url::parse(&self.base).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Deep link to one message in the provider UI.
    pub fn message_link(&self, user_id: &str, message_id: &str) -> String {
        let mut url = match Url::parse(&format!("{}/mail", self.base)) {
            Ok(u) => u,
            Err(_) => return String::new(),
        };
        url.query_pairs_mut()
            .append_pair("user", user_id)
            .append_pair("msg", message_id);
        url.to_string()
    }

    /// True when `href` points at the provider host.
    pub fn is_whitelisted(&self, href: &str) -> bool {
        let Some(base_host) = self.base_host() else { return false };
        match Url::parse(href) {
            Ok(u) => u.host_str() == Some(base_host.as_str()),
            Err(_) => false,
        }
    }
}

/// Escape for HTML attribute context: quotes in addition to the usual
/// three.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_link_encodes_parameters() {
        let links = LinkBuilder::new("https://mail.example.com".to_string());
        let href = links.message_link("user one", "msg&id=x");
        assert!(href.starts_with("https://mail.example.com/mail?"));
        assert!(!href.contains("msg&id"), "raw ampersand must be encoded: {}", href);
        assert!(href.contains("user+one") || href.contains("user%20one"));
    }

    #[test]
    fn test_whitelist_accepts_provider_host_only() {
        let links = LinkBuilder::new("https://mail.example.com".to_string());
        assert!(links.is_whitelisted("https://mail.example.com/mail?msg=1"));
        assert!(!links.is_whitelisted("https://evil.example.net/mail?msg=1"));
        assert!(!links.is_whitelisted("javascript:alert(1)"));
        assert!(!links.is_whitelisted("not a url"));
    }

    #[test]
    fn test_escape_attr_covers_quotes() {
        assert_eq!(
            escape_attr(r#"a&b<c>"d'e"#),
            "a&amp;b&lt;c&gt;&quot;d&#39;e"
        );
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let links = LinkBuilder::new("https://mail.example.com/".to_string());
        let href = links.message_link("u", "m");
        assert!(href.starts_with("https://mail.example.com/mail?"));
    }
}
