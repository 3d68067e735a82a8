use std::cell::RefCell;

use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use select::document::Document;
use select::predicate::{Any, Name};
use url::Url;

use crate::css;
use crate::error::{MirrorError, Result};
use crate::resolver;

/// What a reference points at, as far as the markup tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Stylesheet,
    Script,
    Image,
    Other,
}

/// A resource reference found in a document, exactly as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLink {
    pub reference: String,
    pub resource_type: ResourceType,
}

impl ResourceLink {
    fn new(reference: &str, resource_type: ResourceType) -> Self {
        Self {
            reference: reference.to_string(),
            resource_type,
        }
    }
}

/// Everything a document asks to have mirrored.
#[derive(Debug, Clone)]
pub struct PageResources {
    /// Base URL references resolve against; honors `<base href>`.
    pub base_url: Url,
    pub links: Vec<ResourceLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeRole {
    /// Localized to the mirrored copy.
    Resource(ResourceType),
    /// `srcset`: a list of image candidates.
    SourceSet,
    /// Navigational; made absolute so it still reaches the live site.
    Navigation,
}

use AttributeRole::{Navigation, Resource, SourceSet};

const IMG: &[(&str, AttributeRole)] = &[
    ("src", Resource(ResourceType::Image)),
    ("srcset", SourceSet),
];
const SOURCE: &[(&str, AttributeRole)] = &[
    ("src", Resource(ResourceType::Other)),
    ("srcset", SourceSet),
];
const SCRIPT: &[(&str, AttributeRole)] = &[("src", Resource(ResourceType::Script))];
const VIDEO: &[(&str, AttributeRole)] = &[
    ("src", Resource(ResourceType::Other)),
    ("poster", Resource(ResourceType::Image)),
];
const MEDIA: &[(&str, AttributeRole)] = &[("src", Resource(ResourceType::Other))];
const INPUT: &[(&str, AttributeRole)] = &[("src", Resource(ResourceType::Image))];
const OBJECT: &[(&str, AttributeRole)] = &[("data", Resource(ResourceType::Other))];
const SVG_REF: &[(&str, AttributeRole)] = &[
    ("href", Resource(ResourceType::Image)),
    ("xlink:href", Resource(ResourceType::Image)),
];
const BACKGROUND: &[(&str, AttributeRole)] = &[("background", Resource(ResourceType::Image))];
const ANCHOR: &[(&str, AttributeRole)] = &[("href", Navigation)];
const FORM: &[(&str, AttributeRole)] = &[("action", Navigation)];
const FRAME: &[(&str, AttributeRole)] = &[("src", Navigation)];
const LINK_STYLESHEET: &[(&str, AttributeRole)] = &[("href", Resource(ResourceType::Stylesheet))];
const LINK_SCRIPT: &[(&str, AttributeRole)] = &[("href", Resource(ResourceType::Script))];
const LINK_IMAGE: &[(&str, AttributeRole)] = &[("href", Resource(ResourceType::Image))];
const LINK_OTHER: &[(&str, AttributeRole)] = &[("href", Resource(ResourceType::Other))];

/// Reference-bearing attributes of an element. `style` attributes and
/// `<style>` text are handled separately since every element can carry them.
fn attribute_roles(
    tag: &str,
    rel: Option<&str>,
    as_attr: Option<&str>,
) -> &'static [(&'static str, AttributeRole)] {
    match tag {
        "img" => IMG,
        "source" => SOURCE,
        "script" => SCRIPT,
        "video" => VIDEO,
        "audio" | "track" | "embed" => MEDIA,
        "input" => INPUT,
        "object" => OBJECT,
        "image" | "use" => SVG_REF,
        "body" | "table" | "td" | "th" => BACKGROUND,
        "a" | "area" => ANCHOR,
        "form" => FORM,
        "iframe" | "frame" => FRAME,
        "link" => match link_type(rel.unwrap_or(""), as_attr) {
            Some(ResourceType::Stylesheet) => LINK_STYLESHEET,
            Some(ResourceType::Script) => LINK_SCRIPT,
            Some(ResourceType::Image) => LINK_IMAGE,
            Some(ResourceType::Other) => LINK_OTHER,
            None => &[],
        },
        _ => &[],
    }
}

/// Classify a `<link>` by its `rel` tokens. Hints such as `dns-prefetch`,
/// `preconnect`, `canonical` and `alternate` are not resources.
fn link_type(rel: &str, as_attr: Option<&str>) -> Option<ResourceType> {
    let tokens: Vec<String> = rel
        .split_ascii_whitespace()
        .map(str::to_ascii_lowercase)
        .collect();
    let has = |name: &str| tokens.iter().any(|t| t == name);

    if has("stylesheet") {
        return Some(ResourceType::Stylesheet);
    }
    if tokens.iter().any(|t| t.ends_with("icon") || t.starts_with("apple-touch-icon")) {
        return Some(ResourceType::Image);
    }
    if has("manifest") {
        return Some(ResourceType::Other);
    }
    if has("modulepreload") {
        return Some(ResourceType::Script);
    }
    if has("preload") {
        let destination = as_attr.map(str::to_ascii_lowercase);
        return Some(match destination.as_deref() {
            Some("style") => ResourceType::Stylesheet,
            Some("script") => ResourceType::Script,
            Some("image") => ResourceType::Image,
            _ => ResourceType::Other,
        });
    }
    None
}

/// Finds references in markup and rewrites them.
///
/// Discovery walks the parsed DOM tree. Rewriting streams the original
/// markup through `lol_html`, which only re-serializes the attributes and
/// text that actually change, so everything else comes out byte-for-byte.
#[derive(Clone)]
pub struct HtmlParser {
    base_url: Url,
}

impl HtmlParser {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self::from_base(resolver::parse_base(base_url)?))
    }

    pub fn from_base(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn effective_base(&self, document: &Document) -> Url {
        document
            .find(Name("base"))
            .filter_map(|node| node.attr("href"))
            .next()
            .and_then(|href| self.base_url.join(href.trim()).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or_else(|| self.base_url.clone())
    }

    pub fn extract_resources(&self, html_content: &str) -> PageResources {
        let document = Document::from(html_content);
        let base_url = self.effective_base(&document);
        let mut links = Vec::new();

        for node in document.find(Any) {
            let Some(tag) = node.name() else {
                continue;
            };
            let tag = tag.to_ascii_lowercase();

            for (attr, role) in attribute_roles(&tag, node.attr("rel"), node.attr("as")) {
                let Some(value) = node.attr(attr) else {
                    continue;
                };
                match role {
                    Resource(resource_type) => links.push(ResourceLink::new(value, *resource_type)),
                    SourceSet => links.extend(
                        parse_srcset(value)
                            .into_iter()
                            .map(|candidate| ResourceLink::new(candidate.url, ResourceType::Image)),
                    ),
                    Navigation => {}
                }
            }

            if let Some(style) = node.attr("style") {
                extract_css_links(style, &mut links);
            }
            if tag == "style" {
                extract_css_links(&node.text(), &mut links);
            }
        }

        PageResources { base_url, links }
    }

    /// Rewrite every reference in `html_content`.
    ///
    /// `localize` maps a raw resource reference (resolved against `base_url`)
    /// to its local path, or `None` to leave it as written. Navigational
    /// references are made absolute. `<base href>` is dropped so the local
    /// relative paths resolve against the mirrored document itself.
    pub fn rewrite_links<F>(&self, html_content: &str, base_url: &Url, localize: F) -> Result<String>
    where
        F: Fn(&Url, &str) -> Option<String>,
    {
        let localize = &localize;
        let style_text = RefCell::new(String::new());
        let mut output = Vec::with_capacity(html_content.len());

        {
            let mut rewriter = HtmlRewriter::new(
                Settings {
                    element_content_handlers: vec![
                        element!("base[href]", |el| {
                            el.remove_attribute("href");
                            Ok(())
                        }),
                        element!("*", |el| {
                            let tag = el.tag_name().to_ascii_lowercase();
                            let rel = el.get_attribute("rel");
                            let as_attr = el.get_attribute("as");

                            for (attr, role) in
                                attribute_roles(&tag, rel.as_deref(), as_attr.as_deref())
                            {
                                let Some(raw) = el.get_attribute(attr) else {
                                    continue;
                                };
                                let value = html_escape::decode_html_entities(&raw);
                                let replacement = match role {
                                    Resource(_) => localize(base_url, &value),
                                    SourceSet => rewrite_srcset(&value, |candidate| {
                                        localize(base_url, candidate)
                                    }),
                                    Navigation => resolver::absolutize(base_url, &value),
                                };
                                if let Some(replacement) = replacement {
                                    el.set_attribute(attr, &encode_attribute(&replacement))?;
                                }
                            }

                            if let Some(raw) = el.get_attribute("style") {
                                let value = html_escape::decode_html_entities(&raw);
                                let rewritten = css::rewrite(&value, |reference| {
                                    localize(base_url, &reference.target)
                                });
                                if rewritten != value {
                                    el.set_attribute("style", &encode_attribute(&rewritten))?;
                                }
                            }
                            Ok(())
                        }),
                        text!("style", |chunk| {
                            let mut buffer = style_text.borrow_mut();
                            buffer.push_str(chunk.as_str());
                            if chunk.last_in_text_node() {
                                let rewritten = css::rewrite(&buffer, |reference| {
                                    localize(base_url, &reference.target)
                                });
                                chunk.replace(&rewritten, ContentType::Html);
                                buffer.clear();
                            } else {
                                chunk.remove();
                            }
                            Ok(())
                        }),
                    ],
                    ..Settings::default()
                },
                |c: &[u8]| output.extend_from_slice(c),
            );

            rewriter
                .write(html_content.as_bytes())
                .map_err(|e| MirrorError::Rewrite(e.to_string()))?;
            rewriter
                .end()
                .map_err(|e| MirrorError::Rewrite(e.to_string()))?;
        }

        String::from_utf8(output).map_err(|e| MirrorError::Rewrite(e.to_string()))
    }
}

/// `lol_html` reads attribute values raw and only escapes `"` when writing
/// them back, so a decoded value needs its ampersands re-encoded.
fn encode_attribute(value: &str) -> String {
    value.replace('&', "&amp;")
}

fn extract_css_links(css_text: &str, links: &mut Vec<ResourceLink>) {
    for reference in css::scan(css_text) {
        let resource_type = match reference.kind {
            css::CssReferenceKind::Import => ResourceType::Stylesheet,
            css::CssReferenceKind::Url => ResourceType::Other,
        };
        links.push(ResourceLink {
            reference: reference.target,
            resource_type,
        });
    }
}

/// One `srcset` image candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcsetCandidate<'a> {
    pub url: &'a str,
    pub descriptor: &'a str,
}

/// Split a `srcset` value into candidates. URLs run until whitespace, so
/// commas inside `data:` URIs survive; descriptors run until a comma outside
/// parentheses.
pub fn parse_srcset(value: &str) -> Vec<SrcsetCandidate<'_>> {
    let mut candidates = Vec::new();
    let mut rest = value;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let url_end = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let url = &rest[..url_end];
        rest = &rest[url_end..];

        if url.ends_with(',') {
            candidates.push(SrcsetCandidate {
                url: url.trim_end_matches(','),
                descriptor: "",
            });
            continue;
        }

        let mut depth = 0usize;
        let mut descriptor_end = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    descriptor_end = i;
                    break;
                }
                _ => {}
            }
        }

        candidates.push(SrcsetCandidate {
            url,
            descriptor: rest[..descriptor_end].trim(),
        });
        rest = &rest[descriptor_end..];
    }

    candidates
}

/// Rewrite candidate URLs in a `srcset`, keeping descriptors. `None` when
/// nothing changed.
fn rewrite_srcset<F>(value: &str, mut localize: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut changed = false;
    let rewritten: Vec<String> = parse_srcset(value)
        .into_iter()
        .map(|candidate| {
            let url = match localize(candidate.url) {
                Some(local) => {
                    changed = true;
                    local
                }
                None => candidate.url.to_string(),
            };
            if candidate.descriptor.is_empty() {
                url
            } else {
                format!("{url} {}", candidate.descriptor)
            }
        })
        .collect();

    changed.then(|| rewritten.join(", "))
}
