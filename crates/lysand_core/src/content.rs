/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Rich text handling: wire content maps to stored HTML and back, plus the
//! small rewrites applied when serving HTML (mentions, media proxy).

use lysand_protocol::ContentFormat;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt::Write as _;

pub const MIME_HTML: &str = "text/html";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PLAIN: &str = "text/plain";

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid style regex"));
static FORBIDDEN_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(script|style|iframe|object|embed|form|input|meta|link)\b[^>]*>")
        .expect("valid forbidden tag regex")
});
static EVENT_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid event attr regex")
});
static JS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(href|src)\s*=\s*(?:"\s*javascript:[^"]*"|'\s*javascript:[^']*'|javascript:[^\s>]*)"#)
        .expect("valid js url regex")
});
static SRC_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid src attr regex")
});
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+[^\s<>"'.,;:!?)]"#).expect("valid url regex"));
static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([A-Za-z0-9_](?:[A-Za-z0-9_.-]*[A-Za-z0-9_])?)(?:@([A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*(?::[0-9]+)?))?")
        .expect("valid mention regex")
});
static EMOJI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z0-9_-]+):").expect("valid emoji shortcode regex"));
static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static BLOCK_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|div|li|h[1-6]|blockquote|pre)\s*>").expect("valid block end regex"));

static MD_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").expect("valid heading regex"));
static MD_QUOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^>\s?(.*)$").expect("valid quote regex"));
static MD_UL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-*+]\s+(.*)$").expect("valid ul regex"));
static MD_OL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+[.)]\s+(.*)$").expect("valid ol regex"));
static MD_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").expect("valid code regex"));
static MD_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[([^\]]*)\]\((https?://[^)\s]+)\)").expect("valid image regex")
});
static MD_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").expect("valid link regex"));
static MD_BOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__").expect("valid bold regex"));
static MD_ITALIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\s][^*]*)\*|\b_([^_]+)_\b").expect("valid italic regex"));
static MD_STRIKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~]+)~~").expect("valid strike regex"));

/// A user a piece of content may mention, as it should be linked.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionLink {
    pub username: String,
    /// `None` for users of this server.
    pub host: Option<String>,
    pub href: String,
}

/// Renders a wire content map to the HTML stored on a note: HTML is taken
/// (sanitized), markdown rendered, plain text escaped and linkified. Mentions
/// of `mentions` are then turned into links.
pub fn content_to_html(content: &ContentFormat, mentions: &[MentionLink], local_host: &str) -> String {
    let html = if let Some(entry) = content.get(MIME_HTML) {
        sanitize_html(&entry.content)
    } else if let Some(entry) = content.get(MIME_MARKDOWN) {
        markdown_to_html(&entry.content)
    } else if let Some(entry) = content.get(MIME_PLAIN) {
        linkify(&text_to_html(&entry.content))
    } else {
        String::new()
    };
    link_mentions(&html, mentions, local_host)
}

/// Editable source kept next to the HTML: plain text, else markdown, else
/// whatever the first entry holds.
pub fn content_source(content: &ContentFormat) -> String {
    content
        .get(MIME_PLAIN)
        .or_else(|| content.get(MIME_MARKDOWN))
        .or_else(|| content.values().next())
        .map(|e| e.content.clone())
        .unwrap_or_default()
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// One `<p>` per input line.
pub fn text_to_html(input: &str) -> String {
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.trim().is_empty() {
        return String::new();
    }
    normalized
        .split('\n')
        .map(|line| format!("<p>{}</p>", escape_html(line)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn sanitize_html(input: &str) -> String {
    let s = SCRIPT_RE.replace_all(input, "");
    let s = STYLE_RE.replace_all(&s, "");
    let s = FORBIDDEN_TAG_RE.replace_all(&s, "");
    let s = EVENT_ATTR_RE.replace_all(&s, "");
    let s = JS_URL_RE.replace_all(&s, "${1}=\"#\"");
    s.into_owned()
}

/// Turns bare http(s) URLs in text nodes into links.
pub fn linkify(html: &str) -> String {
    map_text_nodes(html, |text| {
        URL_RE
            .replace_all(text, |c: &Captures<'_>| {
                let url = &c[0];
                format!(r#"<a href="{url}" rel="nofollow noopener noreferrer" target="_blank">{url}</a>"#)
            })
            .into_owned()
    })
}

/// Links `@user` / `@user@host` handles that refer to one of `mentions`.
/// Handles that match nobody are left as text.
pub fn link_mentions(html: &str, mentions: &[MentionLink], local_host: &str) -> String {
    if mentions.is_empty() {
        return html.to_string();
    }
    map_text_nodes(html, |text| {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for c in MENTION_RE.captures_iter(text) {
            let Some(whole) = c.get(0) else { continue };
            let boundary_ok = text[..whole.start()]
                .chars()
                .next_back()
                .map_or(true, |p| !(p.is_alphanumeric() || p == '_' || p == '/' || p == '@'));
            if !boundary_ok {
                continue;
            }
            let username = &c[1];
            let host = c.get(2).map(|m| m.as_str());
            let Some(target) = find_mention(mentions, username, host, local_host) else {
                continue;
            };
            let shown_host = target.host.as_deref().unwrap_or(local_host);
            out.push_str(&text[last..whole.start()]);
            let _ = write!(
                out,
                r#"<a class="u-url mention" rel="nofollow noopener noreferrer" target="_blank" href="{}">@{}@{}</a>"#,
                escape_html(&target.href),
                target.username,
                shown_host
            );
            last = whole.end();
        }
        out.push_str(&text[last..]);
        out
    })
}

fn find_mention<'a>(
    mentions: &'a [MentionLink],
    username: &str,
    host: Option<&str>,
    local_host: &str,
) -> Option<&'a MentionLink> {
    mentions.iter().find(|m| {
        if !m.username.eq_ignore_ascii_case(username) {
            return false;
        }
        match (host, m.host.as_deref()) {
            (None, None) => true,
            (None, Some(_)) => mentions
                .iter()
                .filter(|o| o.username.eq_ignore_ascii_case(username))
                .count()
                == 1,
            (Some(h), None) => h.eq_ignore_ascii_case(local_host),
            (Some(h), Some(mh)) => h.eq_ignore_ascii_case(mh),
        }
    })
}

/// Rewrites `@user@local_host` to `@user` for each of `usernames`. Handles on
/// longer hosts (`local_host.org`, `local_host:8443`) are left alone.
pub fn shorten_local_mentions(html: &str, usernames: &[&str], local_host: &str) -> String {
    let mut out = html.to_string();
    for username in usernames {
        let handle = format!("@{username}@{local_host}");
        let mut shortened = String::with_capacity(out.len());
        let mut rest = out.as_str();
        while let Some(pos) = rest.find(&handle) {
            let after = &rest[pos + handle.len()..];
            shortened.push_str(&rest[..pos]);
            if ends_host(after) {
                shortened.push('@');
                shortened.push_str(username);
            } else {
                shortened.push_str(&handle);
            }
            rest = after;
        }
        shortened.push_str(rest);
        out = shortened;
    }
    out
}

/// Whether a host name cannot continue into `rest`.
fn ends_host(rest: &str) -> bool {
    let mut chars = rest.chars();
    let continues = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric() || c == '-');
    match chars.next() {
        None => true,
        Some('.') => !continues(chars.next()),
        Some(':') => !chars.next().is_some_and(|c| c.is_ascii_digit()),
        c => !continues(c),
    }
}

/// Rewrites every `src` attribute through `proxy`.
pub fn rewrite_media_sources(html: &str, proxy: impl Fn(&str) -> String) -> String {
    SRC_ATTR_RE
        .replace_all(html, |c: &Captures<'_>| {
            let url = c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()).unwrap_or_default();
            format!(r#"src="{}""#, proxy(url))
        })
        .into_owned()
}

/// Distinct `:shortcode:` names in order of first appearance.
pub fn parse_emoji_shortcodes(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in EMOJI_RE.captures_iter(text) {
        let code = c[1].to_string();
        if !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

pub fn html_to_text(html: &str) -> String {
    let s = BR_RE.replace_all(html, "\n");
    let s = BLOCK_END_RE.replace_all(&s, "\n");
    let s = strip_html(&s);
    decode_entities(&s).trim().to_string()
}

pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ => {
                if !in_tag {
                    out.push(c);
                }
            }
        }
    }
    out
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Applies `f` to text outside tags and outside existing `<a>` elements.
fn map_text_nodes(html: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut anchor_depth = 0usize;
    while !rest.is_empty() {
        match rest.find('<') {
            Some(0) => {
                let end = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
                let tag = &rest[..end];
                let lower = tag.to_ascii_lowercase();
                if lower.starts_with("<a ") || lower == "<a>" {
                    anchor_depth += 1;
                } else if lower.starts_with("</a") {
                    anchor_depth = anchor_depth.saturating_sub(1);
                }
                out.push_str(tag);
                rest = &rest[end..];
            }
            Some(i) => {
                let text = &rest[..i];
                if anchor_depth == 0 {
                    out.push_str(&f(text));
                } else {
                    out.push_str(text);
                }
                rest = &rest[i..];
            }
            None => {
                if anchor_depth == 0 {
                    out.push_str(&f(rest));
                } else {
                    out.push_str(rest);
                }
                rest = "";
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Markdown (the subset clients send: headings, quotes, lists, fences, inline)

pub fn markdown_to_html(src: &str) -> String {
    let normalized = src.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let mut blocks: Vec<String> = Vec::new();
    let mut para: Vec<String> = Vec::new();
    let mut i = 0;

    let flush = |para: &mut Vec<String>, blocks: &mut Vec<String>| {
        if !para.is_empty() {
            blocks.push(format!("<p>{}</p>", para.join("<br>")));
            para.clear();
        }
    };

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_end();

        if trimmed.trim_start().starts_with("```") {
            flush(&mut para, &mut blocks);
            let mut code = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                code.push(escape_html(lines[i]));
                i += 1;
            }
            blocks.push(format!("<pre><code>{}</code></pre>", code.join("\n")));
            i += 1;
            continue;
        }
        if trimmed.trim().is_empty() {
            flush(&mut para, &mut blocks);
            i += 1;
            continue;
        }
        if let Some(c) = MD_HEADING_RE.captures(trimmed) {
            flush(&mut para, &mut blocks);
            let level = c[1].len();
            blocks.push(format!("<h{level}>{}</h{level}>", markdown_inline(&c[2])));
            i += 1;
            continue;
        }
        if MD_QUOTE_RE.is_match(trimmed) {
            flush(&mut para, &mut blocks);
            let mut quoted = Vec::new();
            while i < lines.len() {
                let Some(c) = MD_QUOTE_RE.captures(lines[i].trim_end()) else { break };
                quoted.push(markdown_inline(&c[1]));
                i += 1;
            }
            blocks.push(format!("<blockquote><p>{}</p></blockquote>", quoted.join("<br>")));
            continue;
        }
        let list = if MD_UL_RE.is_match(trimmed) {
            Some((&*MD_UL_RE, "ul"))
        } else if MD_OL_RE.is_match(trimmed) {
            Some((&*MD_OL_RE, "ol"))
        } else {
            None
        };
        if let Some((re, tag)) = list {
            flush(&mut para, &mut blocks);
            let mut items = String::new();
            while i < lines.len() {
                let Some(c) = re.captures(lines[i].trim_end()) else { break };
                let _ = write!(items, "<li>{}</li>", markdown_inline(&c[1]));
                i += 1;
            }
            blocks.push(format!("<{tag}>{items}</{tag}>"));
            continue;
        }
        para.push(markdown_inline(trimmed.trim()));
        i += 1;
    }
    flush(&mut para, &mut blocks);
    blocks.join("\n")
}

fn markdown_inline(raw: &str) -> String {
    let s = escape_html(raw);
    let s = MD_CODE_RE.replace_all(&s, "<code>$1</code>");
    let s = MD_IMAGE_RE.replace_all(&s, r#"<img src="$2" alt="$1">"#);
    let s = MD_LINK_RE.replace_all(&s, r#"<a href="$2" rel="nofollow noopener noreferrer" target="_blank">$1</a>"#);
    let s = MD_BOLD_RE.replace_all(&s, |c: &Captures<'_>| {
        let inner = c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()).unwrap_or_default();
        format!("<strong>{inner}</strong>")
    });
    let s = MD_ITALIC_RE.replace_all(&s, |c: &Captures<'_>| {
        let inner = c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()).unwrap_or_default();
        format!("<em>{inner}</em>")
    });
    let s = MD_STRIKE_RE.replace_all(&s, "<del>$1</del>");
    s.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lysand_protocol::content_of;

    #[test]
    fn plain_text_becomes_escaped_paragraphs_with_links() {
        let html = content_to_html(
            &content_of(MIME_PLAIN, "hi <b>\nsee https://example.org/x."),
            &[],
            "local.example",
        );
        assert_eq!(
            html,
            "<p>hi &lt;b&gt;</p>\n<p>see <a href=\"https://example.org/x\" rel=\"nofollow noopener noreferrer\" target=\"_blank\">https://example.org/x</a>.</p>"
        );
    }

    #[test]
    fn html_wins_over_other_formats_and_is_sanitized() {
        let mut content = content_of(MIME_PLAIN, "plain");
        content.extend(content_of(
            MIME_HTML,
            r#"<p onclick="x()">ok</p><script>alert(1)</script><a href="javascript:evil()">l</a>"#,
        ));
        let html = content_to_html(&content, &[], "local.example");
        assert_eq!(html, r##"<p>ok</p><a href="#">l</a>"##);
    }

    #[test]
    fn markdown_subset_renders() {
        let html = markdown_to_html("# Title\n\nsome **bold** and *it* `code`\n\n- a\n- b\n\n> q");
        assert_eq!(
            html,
            "<h1>Title</h1>\n<p>some <strong>bold</strong> and <em>it</em> <code>code</code></p>\n<ul><li>a</li><li>b</li></ul>\n<blockquote><p>q</p></blockquote>"
        );
    }

    #[test]
    fn source_prefers_plain_then_markdown() {
        let mut content = content_of(MIME_HTML, "<p>x</p>");
        assert_eq!(content_source(&content), "<p>x</p>");
        content.extend(content_of(MIME_MARKDOWN, "*x*"));
        assert_eq!(content_source(&content), "*x*");
        content.extend(content_of(MIME_PLAIN, "x"));
        assert_eq!(content_source(&content), "x");
        assert_eq!(content_source(&ContentFormat::new()), "");
    }

    #[test]
    fn mentions_are_linked_once_and_only_when_known() {
        let mentions = vec![
            MentionLink {
                username: "alice".into(),
                host: None,
                href: "https://local.example/users/1".into(),
            },
            MentionLink {
                username: "bob".into(),
                host: Some("remote.example".into()),
                href: "https://remote.example/users/bob".into(),
            },
        ];
        let html = link_mentions(
            "<p>@alice and @bob@remote.example, not @carol or mail@alice</p>",
            &mentions,
            "local.example",
        );
        assert!(html.contains(r#"href="https://local.example/users/1">@alice@local.example</a>"#));
        assert!(html.contains(r#"href="https://remote.example/users/bob">@bob@remote.example</a>"#));
        assert!(html.contains("not @carol or mail@alice"));
    }

    #[test]
    fn local_mentions_shorten() {
        let html = shorten_local_mentions("<a>@alice@local.example</a> @bob@remote.example", &["alice"], "local.example");
        assert_eq!(html, "<a>@alice</a> @bob@remote.example");
    }

    #[test]
    fn local_mentions_only_shorten_on_the_exact_host() {
        let html = shorten_local_mentions(
            "@bob@local.example.org @bob@local.example:8443 @bob@local.examples @bob@local.example. @bob@local.example-x @bob@local.example",
            &["bob"],
            "local.example",
        );
        assert_eq!(
            html,
            "@bob@local.example.org @bob@local.example:8443 @bob@local.examples @bob. @bob@local.example-x @bob"
        );
    }

    #[test]
    fn media_sources_go_through_the_proxy() {
        let html = rewrite_media_sources(r#"<img src="https://cdn/a.png"><img src='b.png'>"#, |u| format!("P({u})"));
        assert_eq!(html, r#"<img src="P(https://cdn/a.png)"><img src="P(b.png)">"#);
    }

    #[test]
    fn emoji_shortcodes_are_distinct_and_ordered() {
        assert_eq!(parse_emoji_shortcodes("<p>:blob: hi :cat_1: :blob:</p>"), vec!["blob", "cat_1"]);
    }

    #[test]
    fn html_to_text_keeps_line_breaks() {
        assert_eq!(html_to_text("<p>a &amp; b</p><p>c<br>d</p>"), "a & b\nc\nd");
    }
}
