use url::Url;

use crate::error::{MirrorError, Result};

/// What a raw reference found in markup or a stylesheet turns out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// An http(s) resource. `url` carries no fragment; the fragment, if any,
    /// is kept aside so it can be re-attached to the local path.
    Fetchable { url: Url, fragment: Option<String> },
    /// A `data:` URI.
    Embedded,
    /// `mailto:`, `tel:`, `javascript:`, bare fragments, empty references and
    /// anything else that is not http(s).
    NonNavigable,
    /// The reference could not be parsed against its base.
    Malformed(String),
}

impl Reference {
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Reference::Fetchable { .. })
    }
}

/// Parse a caller-supplied absolute URL, such as the page to mirror or a seed
/// from a browser network log.
pub fn parse_base(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| MirrorError::MalformedReference {
        reference: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(MirrorError::MalformedReference {
            reference: url.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// Resolve `reference` against `base` and classify the result.
pub fn resolve(base: &Url, reference: &str) -> Reference {
    let reference = reference.trim_matches(|c: char| c.is_ascii_whitespace());
    if reference.is_empty() || reference.starts_with('#') {
        return Reference::NonNavigable;
    }

    let mut absolute = match base.join(reference) {
        Ok(url) => url,
        Err(e) => return Reference::Malformed(e.to_string()),
    };

    match absolute.scheme() {
        "http" | "https" => {
            let fragment = absolute.fragment().map(str::to_owned);
            absolute.set_fragment(None);
            Reference::Fetchable {
                url: absolute,
                fragment,
            }
        }
        "data" => Reference::Embedded,
        _ => Reference::NonNavigable,
    }
}

/// Absolute remote form of a navigational reference (`<a href>` and friends).
/// Returns `None` when the reference should stay as written.
pub fn absolutize(base: &Url, reference: &str) -> Option<String> {
    let trimmed = reference.trim_matches(|c: char| c.is_ascii_whitespace());
    match resolve(base, trimmed) {
        Reference::Fetchable { mut url, fragment } => {
            url.set_fragment(fragment.as_deref());
            let absolute = url.to_string();
            (absolute != reference).then_some(absolute)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/subdir/").unwrap()
    }

    #[test]
    fn test_url_resolution() {
        let test_cases = vec![
            ("../style.css", "https://example.com/style.css"),
            ("./script.js", "https://example.com/subdir/script.js"),
            ("images/photo.jpg", "https://example.com/subdir/images/photo.jpg"),
            ("https://cdn.example.com/style.css", "https://cdn.example.com/style.css"),
            ("//cdn.example.com/script.js", "https://cdn.example.com/script.js"),
            ("/a/./b/../c.png", "https://example.com/a/c.png"),
            ("  padded.png\n", "https://example.com/subdir/padded.png"),
        ];

        for (input, expected) in test_cases {
            match resolve(&base(), input) {
                Reference::Fetchable { url, .. } => {
                    assert_eq!(url.as_str(), expected, "Failed for input: {}", input)
                }
                other => panic!("expected fetchable for {input}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_fragment_is_split_off() {
        let reference = resolve(&base(), "icons.svg#close");
        assert_eq!(
            reference,
            Reference::Fetchable {
                url: Url::parse("https://example.com/subdir/icons.svg").unwrap(),
                fragment: Some("close".to_string()),
            }
        );
    }

    #[test]
    fn test_classification_of_non_fetchable_references() {
        assert_eq!(resolve(&base(), "data:image/png;base64,AAAA"), Reference::Embedded);
        assert_eq!(resolve(&base(), "mailto:me@example.com"), Reference::NonNavigable);
        assert_eq!(resolve(&base(), "tel:+123"), Reference::NonNavigable);
        assert_eq!(resolve(&base(), "javascript:void(0)"), Reference::NonNavigable);
        assert_eq!(resolve(&base(), "#top"), Reference::NonNavigable);
        assert_eq!(resolve(&base(), ""), Reference::NonNavigable);
        assert_eq!(resolve(&base(), "ftp://example.com/file"), Reference::NonNavigable);
    }

    #[test]
    fn test_malformed_reference() {
        assert!(matches!(
            resolve(&base(), "http://[::1"),
            Reference::Malformed(_)
        ));
    }

    #[test]
    fn test_absolutize_navigation() {
        assert_eq!(
            absolutize(&base(), "../about#team").as_deref(),
            Some("https://example.com/about#team")
        );
        assert_eq!(absolutize(&base(), "https://example.com/"), None);
        assert_eq!(absolutize(&base(), "#top"), None);
        assert_eq!(absolutize(&base(), "mailto:me@example.com"), None);
    }

    #[test]
    fn test_parse_base() {
        assert!(parse_base("https://example.com/page").is_ok());
        assert!(matches!(
            parse_base("not a url"),
            Err(MirrorError::MalformedReference { .. })
        ));
        assert!(parse_base("file:///tmp/index.html").is_err());
    }
}
