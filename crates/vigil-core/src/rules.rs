//! Ad-block rule compilation and URL matching.
//!
//! One line of ad-block syntax compiles into one immutable match unit:
//!
//! - `!` comment lines and blank lines are skipped
//! - `@@` marks an exception (allow-list) rule
//! - `||` anchors the pattern to the start of a hostname
//! - `|` at either end anchors to the start/end of the address
//! - `^` matches a separator character (or the end of the address)
//! - `*` matches any run of characters
//! - `$` introduces comma-separated options (`domain=`, `third-party`,
//!   resource-type keywords)
//! - `##` / `#@#` produce element-hiding rules without a blocking pattern
//!
//! Matching is case-insensitive on hostname components and case-sensitive
//! elsewhere: request hosts are lowercased before matching and the hostname
//! portion of anchored patterns is lowercased at compile time.
//!
//! Text triggers are plain literal substrings, one per line, no escaping.

use bitflags::bitflags;

use crate::error::{ParseError, Result};

bitflags! {
    /// Resource-type restriction mask. An empty mask means "all types".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceMask: u32 {
        const SCRIPT = 1;
        const IMAGE = 1 << 1;
        const STYLESHEET = 1 << 2;
        const OBJECT = 1 << 3;
        const DOCUMENT = 1 << 4;
        const SUBDOCUMENT = 1 << 5;
        const XMLHTTPREQUEST = 1 << 6;
        const MEDIA = 1 << 7;
        const FONT = 1 << 8;
        const WEBSOCKET = 1 << 9;
        const OTHER = 1 << 10;
    }
}

/// Resource type of a single request, as reported by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Script,
    Image,
    Stylesheet,
    Object,
    Document,
    Subdocument,
    XmlHttpRequest,
    Media,
    Font,
    Websocket,
    Other,
}

impl ResourceKind {
    /// The mask bit for this resource type.
    pub fn mask(self) -> ResourceMask {
        match self {
            Self::Script => ResourceMask::SCRIPT,
            Self::Image => ResourceMask::IMAGE,
            Self::Stylesheet => ResourceMask::STYLESHEET,
            Self::Object => ResourceMask::OBJECT,
            Self::Document => ResourceMask::DOCUMENT,
            Self::Subdocument => ResourceMask::SUBDOCUMENT,
            Self::XmlHttpRequest => ResourceMask::XMLHTTPREQUEST,
            Self::Media => ResourceMask::MEDIA,
            Self::Font => ResourceMask::FONT,
            Self::Websocket => ResourceMask::WEBSOCKET,
            Self::Other => ResourceMask::OTHER,
        }
    }
}

fn resource_keyword(name: &str) -> Option<ResourceMask> {
    match name {
        "script" => Some(ResourceMask::SCRIPT),
        "image" => Some(ResourceMask::IMAGE),
        "stylesheet" => Some(ResourceMask::STYLESHEET),
        "object" => Some(ResourceMask::OBJECT),
        "document" => Some(ResourceMask::DOCUMENT),
        "subdocument" => Some(ResourceMask::SUBDOCUMENT),
        "xmlhttprequest" | "xhr" => Some(ResourceMask::XMLHTTPREQUEST),
        "media" => Some(ResourceMask::MEDIA),
        "font" => Some(ResourceMask::FONT),
        "websocket" => Some(ResourceMask::WEBSOCKET),
        "other" => Some(ResourceMask::OTHER),
        _ => None,
    }
}

/// First/third-party restriction on a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartyScope {
    #[default]
    Any,
    FirstParty,
    ThirdParty,
}

/// Options attached to a blocking/exception rule after `$`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOptions {
    pub party: PartyScope,
    pub resources: ResourceMask,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl RuleOptions {
    /// Whether this rule is applicable to a request before pattern matching.
    fn applies(&self, host: &str, requesting_domain: &str, resource: ResourceKind) -> bool {
        if !self.resources.is_empty() && !self.resources.contains(resource.mask()) {
            return false;
        }

        match self.party {
            PartyScope::Any => {}
            PartyScope::ThirdParty => {
                if !is_third_party(host, requesting_domain) {
                    return false;
                }
            }
            PartyScope::FirstParty => {
                if is_third_party(host, requesting_domain) {
                    return false;
                }
            }
        }

        if self
            .exclude_domains
            .iter()
            .any(|d| domain_matches(requesting_domain, d))
        {
            return false;
        }
        if !self.include_domains.is_empty()
            && !self
                .include_domains
                .iter()
                .any(|d| domain_matches(requesting_domain, d))
        {
            return false;
        }

        true
    }
}

/// Returns true when `host` equals `base` or is a subdomain of it, on a
/// label boundary.
pub(crate) fn domain_matches(host: &str, base: &str) -> bool {
    if host == base {
        return true;
    }
    host.len() > base.len()
        && host.ends_with(base)
        && host.as_bytes()[host.len() - base.len() - 1] == b'.'
}

/// Label-boundary third-party check between a request host and the domain
/// of the document that issued the request. No public-suffix list.
pub fn is_third_party(host: &str, requesting_domain: &str) -> bool {
    if requesting_domain.is_empty() {
        return false;
    }
    !domain_matches(host, requesting_domain) && !domain_matches(requesting_domain, host)
}

/// One element of a compiled pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternToken {
    Literal(String),
    Wildcard,
    Separator,
}

/// Compiled blocking pattern: anchors plus a token sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RulePattern {
    hostname_anchor: bool,
    start_anchor: bool,
    end_anchor: bool,
    tokens: Vec<PatternToken>,
}

fn is_separator_char(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '%'))
}

impl RulePattern {
    fn compile(pattern: &str) -> Result<Self> {
        let mut body = pattern;
        let mut hostname_anchor = false;
        let mut start_anchor = false;

        if let Some(rest) = body.strip_prefix("||") {
            hostname_anchor = true;
            body = rest;
        } else if let Some(rest) = body.strip_prefix('|') {
            start_anchor = true;
            body = rest;
        }

        let end_anchor = body.ends_with('|');
        if end_anchor {
            body = &body[..body.len() - 1];
        }

        let mut tokens = Vec::new();
        let mut literal = String::new();
        for c in body.chars() {
            match c {
                '*' => {
                    if !literal.is_empty() {
                        tokens.push(PatternToken::Literal(std::mem::take(&mut literal)));
                    }
                    if tokens.last() != Some(&PatternToken::Wildcard) {
                        tokens.push(PatternToken::Wildcard);
                    }
                }
                '^' => {
                    if !literal.is_empty() {
                        tokens.push(PatternToken::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(PatternToken::Separator);
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(PatternToken::Literal(literal));
        }

        if tokens.is_empty() && !hostname_anchor && !start_anchor {
            return Err(ParseError::EmptyPattern);
        }

        // The hostname portion of anchored patterns matches case-insensitively,
        // so fold it at compile time. Start-anchored patterns carry a scheme,
        // so the path begins at the first '/' past "://"; everything from
        // there on stays as written.
        if hostname_anchor || start_anchor {
            if let Some(PatternToken::Literal(first)) = tokens.first_mut() {
                let authority = first.find("://").map(|i| i + 3).unwrap_or(0);
                let split = first[authority..]
                    .find('/')
                    .map(|i| i + authority)
                    .unwrap_or(first.len());
                let folded = first[..split].to_ascii_lowercase();
                *first = folded + &first[split..];
            }
        }

        Ok(Self {
            hostname_anchor,
            start_anchor,
            end_anchor,
            tokens,
        })
    }

    /// Matches this pattern against a normalized request URL.
    pub fn matches(&self, url: &RequestUrl) -> bool {
        let target = url.as_str();

        if self.start_anchor {
            return self.match_at(target, 0);
        }

        if self.hostname_anchor {
            // Candidate starts: beginning of the host and each position after
            // a '.' within the host, so `||example.com` also matches
            // `ads.example.com` but never `notexample.com`.
            let mut pos = url.host_start();
            loop {
                if self.match_at(target, pos) {
                    return true;
                }
                match target[pos..url.host_end()].find('.') {
                    Some(i) => pos = pos + i + 1,
                    None => return false,
                }
            }
        }

        (0..=target.len()).any(|p| target.is_char_boundary(p) && self.match_at(target, p))
    }

    fn match_at(&self, target: &str, pos: usize) -> bool {
        Self::match_tokens(&self.tokens, target, pos, self.end_anchor)
    }

    fn match_tokens(tokens: &[PatternToken], target: &str, mut pos: usize, end_anchor: bool) -> bool {
        for (i, token) in tokens.iter().enumerate() {
            match token {
                PatternToken::Literal(lit) => {
                    if !target[pos..].starts_with(lit.as_str()) {
                        return false;
                    }
                    pos += lit.len();
                }
                PatternToken::Separator => {
                    if pos == target.len() {
                        // '^' also matches the end of the address.
                        continue;
                    }
                    let c = match target[pos..].chars().next() {
                        Some(c) if is_separator_char(c) => c,
                        _ => return false,
                    };
                    pos += c.len_utf8();
                }
                PatternToken::Wildcard => {
                    let rest = &tokens[i + 1..];
                    if rest.is_empty() {
                        return true;
                    }
                    return (pos..=target.len()).any(|p| {
                        target.is_char_boundary(p)
                            && Self::match_tokens(rest, target, p, end_anchor)
                    });
                }
            }
        }
        !end_anchor || pos == target.len()
    }
}

/// A request URL normalized for matching: the host component is lowercased,
/// the rest is kept as written.
#[derive(Debug, Clone)]
pub struct RequestUrl {
    normalized: String,
    host_start: usize,
    host_end: usize,
}

impl RequestUrl {
    /// Parses a URL, locating and lowercasing its host component.
    pub fn parse(url: &str) -> Self {
        let host_start = url.find("://").map(|i| i + 3).unwrap_or(0);
        let host_end = url[host_start..]
            .find(['/', '?', '#', ':'])
            .map(|i| i + host_start)
            .unwrap_or(url.len());

        let mut normalized = String::with_capacity(url.len());
        normalized.push_str(&url[..host_start].to_ascii_lowercase());
        normalized.push_str(&url[host_start..host_end].to_ascii_lowercase());
        normalized.push_str(&url[host_end..]);

        Self {
            normalized,
            host_start,
            host_end,
        }
    }

    /// The normalized URL.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// The lowercased host component.
    pub fn host(&self) -> &str {
        &self.normalized[self.host_start..self.host_end]
    }

    fn host_start(&self) -> usize {
        self.host_start
    }

    fn host_end(&self) -> usize {
        self.host_end
    }
}

/// A compiled blocking or exception rule. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// The source line, kept verbatim for reporting.
    pub raw: String,
    /// `@@` exception rules override blocking rules in the same category.
    pub exception: bool,
    pub pattern: RulePattern,
    pub options: RuleOptions,
}

impl FilterRule {
    /// Full applicability check: options first, then the pattern.
    pub fn matches(&self, url: &RequestUrl, requesting_domain: &str, resource: ResourceKind) -> bool {
        self.options.applies(url.host(), requesting_domain, resource)
            && self.pattern.matches(url)
    }
}

/// A compiled element-hiding rule. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct HidingRule {
    pub raw: String,
    /// `#@#` excepts the selector instead of hiding it.
    pub exception: bool,
    pub selector: String,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl HidingRule {
    /// Whether this rule applies to pages served from `domain`.
    pub fn applies_to(&self, domain: &str) -> bool {
        if self
            .exclude_domains
            .iter()
            .any(|d| domain_matches(domain, d))
        {
            return false;
        }
        self.include_domains.is_empty()
            || self
                .include_domains
                .iter()
                .any(|d| domain_matches(domain, d))
    }
}

/// A plain literal substring trigger. Immutable once compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTrigger {
    pub text: String,
}

/// Outcome of compiling one line of ad-block syntax.
#[derive(Debug, Clone)]
pub enum CompiledLine {
    /// A blocking or exception rule.
    Filter(FilterRule),
    /// An element-hiding rule.
    Hiding(HidingRule),
    /// Comment, list header, or blank line.
    Skip,
}

/// Compiles one line of ad-block syntax.
///
/// Comments (`!`), list headers (`[...]`), and blank lines yield
/// [`CompiledLine::Skip`]; malformed lines yield a [`ParseError`]. Neither
/// aborts a batch: callers count and continue.
pub fn compile_rule(line: &str) -> Result<CompiledLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return Ok(CompiledLine::Skip);
    }

    // Element hiding: `domains##selector` / `domains#@#selector`.
    for (marker, exception) in [("#@#", true), ("##", false)] {
        if let Some(idx) = line.find(marker) {
            let selector = line[idx + marker.len()..].trim();
            if selector.is_empty() {
                return Err(ParseError::BadSelector);
            }
            let (include_domains, exclude_domains) = parse_hiding_domains(&line[..idx]);
            return Ok(CompiledLine::Hiding(HidingRule {
                raw: line.to_string(),
                exception,
                selector: selector.to_string(),
                include_domains,
                exclude_domains,
            }));
        }
    }

    let (exception, rest) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let (pattern_part, options_part) = match rest.find('$') {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };

    let options = match options_part {
        Some(text) => parse_options(text)?,
        None => RuleOptions::default(),
    };

    let pattern = RulePattern::compile(pattern_part.trim())?;

    Ok(CompiledLine::Filter(FilterRule {
        raw: line.to_string(),
        exception,
        pattern,
        options,
    }))
}

/// Compiles one text-trigger line. Whitespace is trimmed; blank lines are
/// skipped; everything else becomes a literal substring trigger.
pub fn compile_text_trigger(line: &str) -> Option<TextTrigger> {
    let text = line.trim();
    if text.is_empty() {
        None
    } else {
        Some(TextTrigger {
            text: text.to_string(),
        })
    }
}

fn parse_hiding_domains(list: &str) -> (Vec<String>, Vec<String>) {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for raw in list.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (negated, name) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if let Some(domain) = normalize_domain(name) {
            if negated {
                exclude.push(domain);
            } else {
                include.push(domain);
            }
        }
    }
    (include, exclude)
}

fn parse_options(text: &str) -> Result<RuleOptions> {
    let mut options = RuleOptions::default();
    let mut include_mask = ResourceMask::empty();
    let mut exclude_mask = ResourceMask::empty();

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let lower = raw.to_ascii_lowercase();

        if let Some(value) = lower.strip_prefix("domain=") {
            parse_domain_option(value, &mut options)?;
            continue;
        }

        let (negated, name) = match lower.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, lower.as_str()),
        };

        match name {
            "third-party" | "3p" => {
                options.party = if negated {
                    PartyScope::FirstParty
                } else {
                    PartyScope::ThirdParty
                };
            }
            "first-party" | "1p" => {
                options.party = if negated {
                    PartyScope::ThirdParty
                } else {
                    PartyScope::FirstParty
                };
            }
            "match-case" => {
                // Recognized for list compatibility; matching already keeps
                // paths case-sensitive.
            }
            _ => match resource_keyword(name) {
                Some(mask) if negated => exclude_mask |= mask,
                Some(mask) => include_mask |= mask,
                None => return Err(ParseError::UnknownOption(raw.to_string())),
            },
        }
    }

    options.resources = if include_mask.is_empty() && exclude_mask.is_empty() {
        ResourceMask::empty()
    } else if include_mask.is_empty() {
        ResourceMask::all() - exclude_mask
    } else {
        include_mask - exclude_mask
    };

    Ok(options)
}

fn parse_domain_option(value: &str, options: &mut RuleOptions) -> Result<()> {
    let mut any = false;
    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (negated, name) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if let Some(domain) = normalize_domain(name) {
            any = true;
            if negated {
                options.exclude_domains.push(domain);
            } else {
                options.include_domains.push(domain);
            }
        }
    }
    if any {
        Ok(())
    } else {
        Err(ParseError::BadDomainList)
    }
}

fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}
