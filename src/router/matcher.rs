//! Path patterns and the flat dispatch table built from them.
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/users/` and
//! `/users` are treated as equivalent. When several patterns match a path, the most
//! specific wins: comparing segment by segment, a literal beats a `:param`, which beats
//! a wildcard. `/users/me` is therefore reachable next to `/users/:id` whatever the
//! registration order. Patterns of equal rank resolve in insertion order.

use crate::context::Parameters;
use crate::http::Method;

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Static(String),
    Parameter(String),
}

/// Compiled representation of a route pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pattern {
    // Matches one exact path string, e.g. `/users`.
    Exact(String),
    // Matches a fixed number of segments where some may be named captures, e.g. `/users/:id`.
    Parameterized { segments: Vec<Segment> },
    // Matches any path that starts with the given prefix, e.g. `/files/*`.
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Parse a route pattern string.
    ///
    /// 1. Ends with `/*` → wildcard, matching any path sharing the prefix.
    /// 2. Contains a `:name` segment → parameterized.
    /// 3. Otherwise → exact.
    pub(crate) fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.split('/').any(|s| s.starts_with(':')) {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();

            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    // Per-segment rank used to order overlapping patterns: 3 for a literal,
    // 2 for a parameter, then 1 to close a fixed-length pattern or 0 for the
    // trailing wildcard.
    fn specificity(&self) -> Vec<u8> {
        fn literals(path: &str) -> impl Iterator<Item = u8> + '_ {
            path.split('/').filter(|s| !s.is_empty()).map(|_| 3)
        }

        match self {
            Pattern::Exact(p) => literals(p).chain([1]).collect(),
            Pattern::Parameterized { segments } => segments
                .iter()
                .map(|seg| match seg {
                    Segment::Static(_) => 3,
                    Segment::Parameter(_) => 2,
                })
                .chain([1])
                .collect(),
            Pattern::Wildcard(prefix) => literals(prefix).chain([0]).collect(),
        }
    }

    // Try to match `path` against this pattern, returning extracted parameters on success.
    fn matches(&self, path: &str) -> Option<Parameters> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(Parameters::new),
            Pattern::Parameterized { segments } => {
                let mut params = Parameters::new();
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

                if segments.len() != path_segments.len() {
                    return None;
                }

                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }

                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = Parameters::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                Some(params)
            }
        }
    }
}

struct Entry<E> {
    method: Method,
    pattern: Pattern,
    rank: Vec<u8>,
    endpoint: E,
}

/// Outcome of a dispatch-table lookup.
pub(crate) enum Lookup<'a, E> {
    /// A registered entry matched method and path.
    Found(&'a E, Parameters),
    /// The path is registered, but not for this method.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// Method + pattern → endpoint table. Written while the router finalizes,
/// read-only afterwards.
pub(crate) struct DispatchTable<E> {
    entries: Vec<Entry<E>>,
}

impl<E> DispatchTable<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds an entry. Returns `false` (and keeps the existing entry) when the
    /// same method and pattern are already registered.
    pub(crate) fn insert(&mut self, method: Method, path: &str, endpoint: E) -> bool {
        let pattern = Pattern::parse(path);
        if self
            .entries
            .iter()
            .any(|e| e.method == method && e.pattern == pattern)
        {
            return false;
        }
        let rank = pattern.specificity();
        self.entries.push(Entry {
            method,
            pattern,
            rank,
            endpoint,
        });
        true
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Lookup<'_, E> {
        let mut allowed = Vec::new();
        let mut best: Option<(&Entry<E>, Parameters)> = None;

        for entry in &self.entries {
            let Some(params) = entry.pattern.matches(path) else {
                continue;
            };
            if &entry.method != method {
                if !allowed.contains(&entry.method) {
                    allowed.push(entry.method.clone());
                }
                continue;
            }
            if best.as_ref().is_none_or(|(current, _)| entry.rank > current.rank) {
                best = Some((entry, params));
            }
        }

        if let Some((entry, params)) = best {
            Lookup::Found(&entry.endpoint, params)
        } else if allowed.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::MethodNotAllowed(allowed)
        }
    }

    pub(crate) fn contains(&self, method: &Method, path: &str) -> bool {
        matches!(self.lookup(method, path), Lookup::Found(..))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
