//! Stylesheet reference scanning and rewriting.
//!
//! Stylesheets are walked token by token with `cssparser`, so references inside
//! comments or ordinary strings are never mistaken for `url()`s, and nested
//! blocks (`@media`, `@supports`, `@font-face`, …) are searched as well. Each
//! reference is recorded with its byte span; [`splice`] rebuilds the text and
//! replaces only the spans the caller provides a new target for.

use std::borrow::Cow;
use std::ops::Range;

use cssparser::{ParseError, Parser, ParserInput, Token};

/// How a stylesheet refers to something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CssReferenceKind {
    /// Target of an `@import` rule; always another stylesheet.
    Import,
    /// Any other `url(...)`.
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    /// `@import "x"`; keeps its quote character.
    Quoted(char),
    /// `url(x)`, `url("x")`, `url('x')`.
    UrlFunction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssReference {
    pub kind: CssReferenceKind,
    /// The reference as written, with CSS escapes resolved.
    pub target: String,
    /// Byte range of the whole token (`url(...)` or the quoted string).
    pub span: Range<usize>,
    form: Form,
}

impl CssReference {
    fn render(&self, target: &str) -> String {
        match self.form {
            Form::Quoted(quote) => format!("{quote}{}{quote}", escape_string(target, quote)),
            Form::UrlFunction => css_url(target),
        }
    }
}

/// Every `@import` and `url()` reference in `css`, in source order.
pub fn scan(css: &str) -> Vec<CssReference> {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut references = Vec::new();
    scan_block(css, &mut parser, &mut references);
    references
}

fn scan_block<'i, 't>(css: &str, parser: &mut Parser<'i, 't>, out: &mut Vec<CssReference>) {
    let mut in_import = false;

    loop {
        let start = parser.position().byte_index();
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };

        match token {
            Token::WhiteSpace(_) | Token::Comment(_) => {}
            Token::AtKeyword(ref name) => {
                in_import = name.eq_ignore_ascii_case("import");
            }
            Token::QuotedString(ref value) if in_import => {
                in_import = false;
                let quote = css[start..].chars().next().unwrap_or('"');
                out.push(CssReference {
                    kind: CssReferenceKind::Import,
                    target: value.to_string(),
                    span: start..parser.position().byte_index(),
                    form: Form::Quoted(quote),
                });
            }
            Token::UnquotedUrl(ref value) => {
                out.push(CssReference {
                    kind: reference_kind(in_import),
                    target: value.to_string(),
                    span: start..parser.position().byte_index(),
                    form: Form::UrlFunction,
                });
                in_import = false;
            }
            Token::Function(ref name) if name.eq_ignore_ascii_case("url") => {
                let target = parser
                    .parse_nested_block(|nested| {
                        let mut target = None;
                        while let Ok(token) = nested.next() {
                            if let Token::QuotedString(value) = token {
                                target = Some(value.to_string());
                            }
                        }
                        Ok::<_, ParseError<'i, ()>>(target)
                    })
                    .ok()
                    .flatten();

                if let Some(target) = target {
                    out.push(CssReference {
                        kind: reference_kind(in_import),
                        target,
                        span: start..parser.position().byte_index(),
                        form: Form::UrlFunction,
                    });
                }
                in_import = false;
            }
            Token::Function(_)
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock
            | Token::CurlyBracketBlock => {
                in_import = false;
                let _ = parser.parse_nested_block(|nested| {
                    scan_block(css, nested, out);
                    Ok::<_, ParseError<'i, ()>>(())
                });
            }
            Token::Semicolon => in_import = false,
            _ => {}
        }
    }
}

fn reference_kind(in_import: bool) -> CssReferenceKind {
    if in_import {
        CssReferenceKind::Import
    } else {
        CssReferenceKind::Url
    }
}

/// Rebuild `css`, replacing each reference for which `replace` returns a new
/// target. Everything else is copied verbatim.
pub fn splice<F>(css: &str, references: &[CssReference], mut replace: F) -> String
where
    F: FnMut(&CssReference) -> Option<String>,
{
    let mut out = String::with_capacity(css.len());
    let mut last = 0;

    for reference in references {
        if reference.span.start < last || reference.span.end > css.len() {
            continue;
        }
        let Some(target) = replace(reference) else {
            continue;
        };
        out.push_str(&css[last..reference.span.start]);
        out.push_str(&reference.render(&target));
        last = reference.span.end;
    }

    out.push_str(&css[last..]);
    out
}

/// Scan and rewrite in one go.
pub fn rewrite<F>(css: &str, replace: F) -> String
where
    F: FnMut(&CssReference) -> Option<String>,
{
    let references = scan(css);
    if references.is_empty() {
        return css.to_string();
    }
    splice(css, &references, replace)
}

/// Stylesheet bytes as text. Anything that is not UTF-8 is read one byte per
/// char, which keeps ASCII syntax intact for any 8-bit charset and lets
/// [`rewrite_bytes`] write every untouched byte back unchanged.
pub fn decode(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

/// [`rewrite`] over raw stylesheet bytes, in whatever encoding [`decode`]
/// picked for them.
pub fn rewrite_bytes<F>(bytes: &[u8], replace: F) -> Vec<u8>
where
    F: FnMut(&CssReference) -> Option<String>,
{
    match decode(bytes) {
        Cow::Borrowed(text) => rewrite(text, replace).into_bytes(),
        Cow::Owned(text) => {
            let rewritten = rewrite(&text, replace);
            if rewritten == text {
                return bytes.to_vec();
            }
            rewritten
                .chars()
                .map(|c| u8::try_from(c).unwrap_or(b'?'))
                .collect()
        }
    }
}

/// Serialize a `url()` token; unquoted when the target allows it.
fn css_url(target: &str) -> String {
    let needs_quotes = target.chars().any(|c| {
        c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\'' | '\\') || c.is_control()
    });
    if needs_quotes {
        format!("url(\"{}\")", escape_string(target, '"'))
    } else {
        format!("url({target})")
    }
}

fn escape_string(value: &str, quote: char) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\a "),
            c if c == quote => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}
