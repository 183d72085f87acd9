//! Glob predicates, in the rclone dialect described by spec §4.2.
//!
//! Grounded in the original `src/match.cc` (rooted/suffix-doublestar/
//! leading-or-trailing-single-star), generalized here to also support `?`,
//! character classes, brace alternation, and escapes, and to apply full
//! glob tokens at every position rather than only the original's restricted
//! "whole pattern is one wildcard" cases.
use crate::error::EngineError;

#[derive(Clone, Debug)]
enum GlobTok {
    Char(char),
    Star,
    Quest,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// One path segment's compiled matcher: an OR of alternatives (brace
/// alternation expands into multiple alternatives).
#[derive(Clone, Debug)]
struct SegMatcher {
    alts: Vec<Vec<GlobTok>>,
}

impl SegMatcher {
    fn compile(alts_src: &[String]) -> Result<SegMatcher, EngineError> {
        let mut alts = Vec::with_capacity(alts_src.len());
        for a in alts_src {
            alts.push(compile_tokens(a)?);
        }
        Ok(SegMatcher { alts })
    }

    fn matches(&self, component: &str) -> bool {
        let chars: Vec<char> = component.chars().collect();
        self.alts.iter().any(|toks| glob_match(toks, &chars))
    }
}

fn compile_tokens(s: &str) -> Result<Vec<GlobTok>, EngineError> {
    let chars: Vec<char> = s.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 1;
                if i >= chars.len() {
                    return Err(EngineError::InvalidGlob(s.to_string()));
                }
                toks.push(GlobTok::Char(chars[i]));
                i += 1;
            }
            '*' => {
                toks.push(GlobTok::Star);
                i += 1;
            }
            '?' => {
                toks.push(GlobTok::Quest);
                i += 1;
            }
            '[' => {
                let start = i + 1;
                let mut j = start;
                let negated = j < chars.len() && (chars[j] == '!' || chars[j] == '^');
                if negated {
                    j += 1;
                }
                let class_start = j;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(EngineError::InvalidGlob(s.to_string()));
                }
                let body: Vec<char> = chars[class_start..j].to_vec();
                let mut ranges = Vec::new();
                let mut k = 0;
                while k < body.len() {
                    if k + 2 < body.len() && body[k + 1] == '-' {
                        ranges.push((body[k], body[k + 2]));
                        k += 3;
                    } else {
                        ranges.push((body[k], body[k]));
                        k += 1;
                    }
                }
                toks.push(GlobTok::Class { negated, ranges });
                i = j + 1;
            }
            c => {
                toks.push(GlobTok::Char(c));
                i += 1;
            }
        }
    }
    Ok(toks)
}

/// Classic backtracking glob match of compiled tokens against a single
/// path component (no `/` involved at this level).
fn glob_match(toks: &[GlobTok], s: &[char]) -> bool {
    fn rec(toks: &[GlobTok], s: &[char]) -> bool {
        if toks.is_empty() {
            return s.is_empty();
        }
        match &toks[0] {
            GlobTok::Star => {
                for k in 0..=s.len() {
                    if rec(&toks[1..], &s[k..]) {
                        return true;
                    }
                }
                false
            }
            GlobTok::Quest => {
                if s.is_empty() {
                    false
                } else {
                    rec(&toks[1..], &s[1..])
                }
            }
            GlobTok::Char(c) => {
                if s.first() == Some(c) {
                    rec(&toks[1..], &s[1..])
                } else {
                    false
                }
            }
            GlobTok::Class { negated, ranges } => {
                if s.is_empty() {
                    return false;
                }
                let c = s[0];
                let in_class = ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
                if in_class != *negated {
                    rec(&toks[1..], &s[1..])
                } else {
                    false
                }
            }
        }
    }
    rec(toks, s)
}

/// Expands `{a,b,c}` brace alternation (possibly nested) into a flat list
/// of alternative strings. Braces may be escaped with `\{`.
fn expand_braces(s: &str) -> Result<Vec<String>, EngineError> {
    let chars: Vec<char> = s.chars().collect();
    let mut open = None;
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == '{' {
            open = Some(i);
            break;
        }
        i += 1;
    }
    let Some(open) = open else {
        return Ok(vec![s.to_string()]);
    };
    // Find the matching close brace, respecting nesting.
    let mut depth = 1;
    let mut j = open + 1;
    while j < chars.len() && depth > 0 {
        match chars[j] {
            '\\' => j += 1,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        j += 1;
    }
    if depth != 0 {
        return Err(EngineError::InvalidGlob(s.to_string()));
    }
    let close = j - 1;
    let body: String = chars[open + 1..close].iter().collect();
    let prefix: String = chars[..open].iter().collect();
    let suffix: String = chars[close + 1..].iter().collect();

    let mut parts = Vec::new();
    let mut depth = 0;
    let mut last = 0;
    let body_chars: Vec<char> = body.chars().collect();
    let mut k = 0;
    while k < body_chars.len() {
        match body_chars[k] {
            '\\' => k += 1,
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(body_chars[last..k].iter().collect::<String>());
                last = k + 1;
            }
            _ => {}
        }
        k += 1;
    }
    parts.push(body_chars[last..].iter().collect::<String>());

    let mut out = Vec::new();
    for part in parts {
        let combined = format!("{}{}{}", prefix, part, suffix);
        out.extend(expand_braces(&combined)?);
    }
    Ok(out)
}

#[derive(Clone, Debug)]
enum Segment {
    /// `**`: matches zero or more whole path components.
    AnyDepth,
    One(SegMatcher),
}

/// A compiled glob pattern.
#[derive(Clone, Debug)]
pub struct Match {
    pattern: String,
    rooted: bool,
    dirs_only: bool,
    segments: Vec<Segment>,
}

impl Match {
    pub fn new() -> Match {
        Match { pattern: String::new(), rooted: false, dirs_only: false, segments: Vec::new() }
    }

    /// Compile `pattern`. Mirrors `Match::use` in the original.
    pub fn use_pattern(&mut self, pattern: &str) -> Result<(), EngineError> {
        if pattern.is_empty() {
            return Err(EngineError::InvalidGlob(pattern.to_string()));
        }
        self.pattern = pattern.to_string();
        let rooted = pattern.starts_with('/');
        let dirs_only = pattern.ends_with('/') && pattern.len() > 1;
        let mut body = pattern.trim_end_matches('/');
        if rooted {
            body = &body[1..];
        }
        let mut segments = Vec::new();
        if !body.is_empty() {
            for raw_seg in body.split('/') {
                if raw_seg == "**" {
                    segments.push(Segment::AnyDepth);
                } else {
                    let alts = expand_braces(raw_seg)?;
                    segments.push(Segment::One(SegMatcher::compile(&alts)?));
                }
            }
        }
        self.rooted = rooted;
        self.dirs_only = dirs_only;
        self.segments = segments;
        Ok(())
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Does `path` (leading `/`, optionally trailing `/` for directories)
    /// match this glob?
    pub fn matches(&self, path: &str) -> bool {
        if self.dirs_only && !path.ends_with('/') {
            return false;
        }
        let trimmed = path.trim_matches('/');
        let components: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        if self.rooted {
            match_segments(&self.segments, &components)
        } else {
            // Unrooted: try matching starting at every component boundary
            // (equivalent to an implicit leading `**`).
            for start in 0..=components.len() {
                if match_segments(&self.segments, &components[start..]) {
                    return true;
                }
            }
            false
        }
    }
}

impl Default for Match {
    fn default() -> Self {
        Self::new()
    }
}

fn match_segments(segments: &[Segment], components: &[&str]) -> bool {
    match segments.split_first() {
        None => components.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            for k in 0..=components.len() {
                if match_segments(rest, &components[k..]) {
                    return true;
                }
            }
            false
        }
        Some((Segment::One(m), rest)) => {
            if components.is_empty() {
                false
            } else {
                m.matches(components[0]) && match_segments(rest, &components[1..])
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FilterKind {
    Include,
    Exclude,
}

/// An ordered include/exclude chain: kept iff no exclude matches, and
/// either no include exists or at least one include matches (spec §4.2).
#[derive(Default, Clone)]
pub struct Filters {
    entries: Vec<(FilterKind, Match)>,
}

impl Filters {
    pub fn new() -> Filters {
        Filters { entries: Vec::new() }
    }

    pub fn add_include(&mut self, pattern: &str) -> Result<(), EngineError> {
        let mut m = Match::new();
        m.use_pattern(pattern)?;
        self.entries.push((FilterKind::Include, m));
        Ok(())
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), EngineError> {
        let mut m = Match::new();
        m.use_pattern(pattern)?;
        self.entries.push((FilterKind::Exclude, m));
        Ok(())
    }

    pub fn is_kept(&self, path: &str) -> bool {
        let mut any_include = false;
        let mut include_matched = false;
        for (kind, m) in &self.entries {
            match kind {
                FilterKind::Exclude => {
                    if m.matches(path) {
                        return false;
                    }
                }
                FilterKind::Include => {
                    any_include = true;
                    if m.matches(path) {
                        include_matched = true;
                    }
                }
            }
        }
        !any_include || include_matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str) -> Match {
        let mut x = Match::new();
        x.use_pattern(pattern).unwrap();
        x
    }

    #[test]
    fn unrooted_basename_matches_anywhere() {
        let g = m("file.jpg");
        assert!(g.matches("/file.jpg"));
        assert!(g.matches("/directory/file.jpg"));
        assert!(!g.matches("/afile.jpg"));
        assert!(!g.matches("/directory/afile.jpg"));
    }

    #[test]
    fn suffix_star_matches_last_component() {
        let g = m("*.jpg");
        assert!(g.matches("/file.jpg"));
        assert!(g.matches("/directory/file.jpg"));
        assert!(!g.matches("/file.jpg/something"));
    }

    #[test]
    fn trailing_doublestar_matches_whole_subtree() {
        let g = m("dir/**");
        assert!(g.matches("/dir/file.jpg"));
        assert!(g.matches("/dir/dir1/dir2/file.jpg"));
        assert!(!g.matches("/directory/file.jpg"));
        assert!(!g.matches("/adir/file.jpg"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let g = m("l?ss");
        assert!(g.matches("/less"));
        assert!(g.matches("/lass"));
        assert!(!g.matches("/floss"));
    }

    #[test]
    fn character_class() {
        let g = m("h[ae]llo");
        assert!(g.matches("/hello"));
        assert!(g.matches("/hallo"));
        assert!(!g.matches("/hullo"));
    }

    #[test]
    fn brace_alternation() {
        let g = m("{one,two}_potato");
        assert!(g.matches("/one_potato"));
        assert!(g.matches("/two_potato"));
        assert!(!g.matches("/three_potato"));
        assert!(!g.matches("/_potato"));
    }

    #[test]
    fn escapes() {
        let g = m("\\*.jpg");
        assert!(g.matches("/*.jpg"));
        assert!(!g.matches("/a.jpg"));
    }

    #[test]
    fn rooted_anchors_at_scan_root() {
        let g = m("/file.jpg");
        assert!(g.matches("/file.jpg"));
        assert!(!g.matches("/afile.jpg"));
        assert!(!g.matches("/directory/file.jpg"));
    }

    #[test]
    fn trailing_slash_matches_directories_only() {
        let g = m("build/");
        assert!(g.matches("/build/"));
        assert!(!g.matches("/build"));
    }

    #[test]
    fn filters_keep_iff_no_exclude_and_include_or_none() {
        let mut f = Filters::new();
        f.add_exclude("*.tmp").unwrap();
        assert!(f.is_kept("/a.txt"));
        assert!(!f.is_kept("/a.tmp"));

        let mut f2 = Filters::new();
        f2.add_include("*.txt").unwrap();
        f2.add_include("*.md").unwrap();
        assert!(f2.is_kept("/a.txt"));
        assert!(f2.is_kept("/a.md"));
        assert!(!f2.is_kept("/a.bin"));
    }
}
