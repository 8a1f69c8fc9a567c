//! Open-pixel and click-link rewriting for single-recipient jobs.

use base64ct::{Base64UrlUnpadded, Encoding};
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(<a\b[^>]*\bhref=")(https?://[^"]+)(")"#).expect("valid href pattern")
});

pub fn click_url(base: &str, token: &Uuid, url: &str) -> String {
    format!(
        "{base}/t/c/{token}?u={}",
        Base64UrlUnpadded::encode_string(url.as_bytes())
    )
}

pub fn open_pixel_url(base: &str, token: &Uuid) -> String {
    format!("{base}/t/o/{token}")
}

/// Rewrites every absolute http(s) anchor href through the click redirect.
pub fn rewrite_links(html: &str, base: &str, token: &Uuid) -> String {
    HREF.replace_all(html, |caps: &regex::Captures| {
        format!("{}{}{}", &caps[1], click_url(base, token, &caps[2]), &caps[3])
    })
    .into_owned()
}

/// Appends the 1x1 open pixel, immediately before `</body>` when present.
pub fn inject_pixel(html: &str, base: &str, token: &Uuid) -> String {
    let pixel = format!(
        r#"<img src="{}" width="1" height="1" style="display:none;" alt="" />"#,
        open_pixel_url(base, token)
    );

    let lower = html.to_ascii_lowercase();
    match lower.rfind("</body>") {
        Some(at) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..at]);
            out.push_str(&pixel);
            out.push_str(&html[at..]);
            out
        }
        None => format!("{html}{pixel}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> Uuid {
        "6c1f7bb9-3f0e-4ed2-9c4e-8f0a4be2d7aa".parse().unwrap()
    }

    #[test]
    fn click_rewrite_is_reversible() {
        let html = r#"<html><body><a href="https://x.example/page">L</a></body></html>"#;
        let out = rewrite_links(html, "https://t.example", &token());

        let expected = format!(
            r#"href="https://t.example/t/c/{}?u=aHR0cHM6Ly94LmV4YW1wbGUvcGFnZQ""#,
            token()
        );
        assert!(out.contains(&expected), "got: {out}");

        let decoded =
            Base64UrlUnpadded::decode_vec("aHR0cHM6Ly94LmV4YW1wbGUvcGFnZQ").unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "https://x.example/page");
    }

    #[test]
    fn relative_and_mailto_links_are_untouched() {
        let html = r##"<a href="/local">a</a><a href="mailto:x@y.tld">b</a>"##;
        assert_eq!(rewrite_links(html, "https://t.example", &token()), html);
    }

    #[test]
    fn pixel_lands_before_closing_body() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_pixel(html, "https://t.example", &token());
        let expected_tail = format!(
            r#"<img src="https://t.example/t/o/{}" width="1" height="1" style="display:none;" alt="" /></body></html>"#,
            token()
        );
        assert!(out.ends_with(&expected_tail), "got: {out}");
    }

    #[test]
    fn pixel_is_appended_without_body_tag() {
        let html = "<p>hi</p>";
        let out = inject_pixel(html, "https://t.example", &token());
        assert!(out.starts_with("<p>hi</p><img src="));
    }

    #[test]
    fn multiple_links_all_rewritten() {
        let html = r#"<a href="http://a.tld/1">1</a> <a class="x" href="https://b.tld/2?q=3">2</a>"#;
        let out = rewrite_links(html, "https://t.example", &token());
        assert!(!out.contains(r#"href="http://a.tld/1""#));
        assert!(!out.contains(r#"href="https://b.tld/2?q=3""#));
        assert_eq!(out.matches("/t/c/").count(), 2);
    }
}
