//! Version parsing, ordering and constraint evaluation.
//!
//! Versions from every supported manager share one ordering: an optional
//! numeric `epoch:`, an upstream part, and an optional `-release` suffix.
//! The upstream and release parts are split into numeric and alphabetic
//! segments that are compared pairwise, numbers numerically. A `~` marks a
//! pre-release and sorts before anything, including the end of the string.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// A version string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct ParseError {
    input: String,
    reason: &'static str,
}

impl ParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Tilde,
    Alpha(String),
    Num(u64),
}

/// A parsed package version.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    raw: String,
    epoch: u64,
    upstream: Vec<Segment>,
    release: Option<Vec<Segment>>,
}

impl Version {
    /// Parse `[epoch:]upstream[-release]`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::new(s, "empty"));
        }
        if !s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(ParseError::new(s, "must start with a letter or digit"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | '_' | ':' | '-' | '!'))
        {
            return Err(ParseError::new(s, "unexpected character"));
        }

        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => (
                e.parse::<u64>()
                    .map_err(|_| ParseError::new(s, "epoch is not a number"))?,
                rest,
            ),
            None => (0, s),
        };

        // Python epochs are written `N!`
        let (epoch, rest) = match rest.split_once('!') {
            Some((e, rest)) if epoch == 0 => (
                e.parse::<u64>()
                    .map_err(|_| ParseError::new(s, "epoch is not a number"))?,
                rest,
            ),
            _ => (epoch, rest),
        };

        let (upstream, release) = match rest.rsplit_once('-') {
            Some((up, rel)) if !up.is_empty() && !rel.is_empty() => (up, Some(rel)),
            _ => (rest, None),
        };
        if upstream.is_empty() {
            return Err(ParseError::new(s, "empty upstream version"));
        }

        Ok(Self {
            raw: s.to_string(),
            epoch,
            upstream: segments(upstream),
            release: release.map(segments),
        })
    }

    /// The version as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compare ignoring the release when either side has none.
    fn cmp_loose(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_segments(&self.upstream, &other.upstream))
    }

    /// Whether the upstream part starts with every segment of `prefix`.
    fn has_prefix(&self, prefix: &Version) -> bool {
        self.epoch == prefix.epoch
            && prefix.upstream.len() <= self.upstream.len()
            && prefix
                .upstream
                .iter()
                .zip(&self.upstream)
                .all(|(p, s)| p == s)
    }
}

fn segments(s: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == '~' {
            chars.next();
            out.push(Segment::Tilde);
        } else if c.is_ascii_digit() {
            let mut n = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                n.push(d);
                chars.next();
            }
            // Absurdly long digit runs saturate rather than fail
            out.push(Segment::Num(n.parse().unwrap_or(u64::MAX)));
        } else if c.is_ascii_alphabetic() {
            let mut a = String::new();
            while let Some(&l) = chars.peek().filter(|l| l.is_ascii_alphabetic()) {
                a.push(l.to_ascii_lowercase());
                chars.next();
            }
            out.push(Segment::Alpha(a));
        } else {
            // Separators only delimit segments
            chars.next();
        }
    }
    out
}

fn compare_segments(a: &[Segment], b: &[Segment]) -> Ordering {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (None, None) => return Ordering::Equal,
            (Some(Segment::Tilde), Some(Segment::Tilde)) => {}
            (Some(Segment::Tilde), _) => return Ordering::Less,
            (_, Some(Segment::Tilde)) => return Ordering::Greater,
            // Trailing zeros do not make a version newer: 1.0 == 1.0.0
            (Some(Segment::Num(0)), None) => {}
            (None, Some(Segment::Num(0))) => {}
            (Some(Segment::Num(_)), None) => return Ordering::Greater,
            (None, Some(Segment::Num(_))) => return Ordering::Less,
            // A trailing word is a pre-release marker: 1.0rc1 < 1.0
            (Some(Segment::Alpha(_)), None) => return Ordering::Less,
            (None, Some(Segment::Alpha(_))) => return Ordering::Greater,
            (Some(Segment::Num(x)), Some(Segment::Num(y))) => match x.cmp(y) {
                Ordering::Equal => {}
                ord => return ord,
            },
            (Some(Segment::Alpha(x)), Some(Segment::Alpha(y))) => match x.cmp(y) {
                Ordering::Equal => {}
                ord => return ord,
            },
            (Some(Segment::Num(_)), Some(Segment::Alpha(_))) => return Ordering::Greater,
            (Some(Segment::Alpha(_)), Some(Segment::Num(_))) => return Ordering::Less,
        }
        i += 1;
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_loose(other).then_with(|| match (&self.release, &other.release) {
            (Some(a), Some(b)) => compare_segments(a, b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Which way an installed version has to move to satisfy a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards a newer version
    Upgrade,
    /// Towards an older version
    Downgrade,
}

/// A version constraint from a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Any version is acceptable
    Any,
    /// Exact version; a constraint without a release matches any release
    Exact(Version),
    /// Any version starting with these segments (`1.2.*`)
    Prefix(Version),
    /// Greater than
    GreaterThan(Version),
    /// Greater than or equal
    GreaterOrEqual(Version),
    /// Less than
    LessThan(Version),
    /// Less than or equal
    LessOrEqual(Version),
    /// Not equal
    NotEqual(Version),
    /// Compatible release (`~=1.4.2` means `>=1.4.2, ==1.4.*`)
    Compatible(Version),
    /// Every constraint must hold
    All(Vec<VersionConstraint>),
}

impl VersionConstraint {
    /// Parse a constraint.
    ///
    /// Accepts `*`, `1.2.3`, `=1.2.3`, `==1.2.3`, `1.2.*`, `>=1.2`, `>1.2`,
    /// `<=2`, `<2`, `!=1.5`, `~=1.4.2`, and comma-separated conjunctions.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(VersionConstraint::Any);
        }

        if s.contains(',') {
            let parts = s
                .split(',')
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(VersionConstraint::All(parts));
        }

        if let Some(rest) = s.strip_prefix("~=") {
            return Ok(VersionConstraint::Compatible(Version::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix(">=") {
            return Ok(VersionConstraint::GreaterOrEqual(Version::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix("<=") {
            return Ok(VersionConstraint::LessOrEqual(Version::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix("!=") {
            return Ok(VersionConstraint::NotEqual(Version::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix('>') {
            return Ok(VersionConstraint::GreaterThan(Version::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix('<') {
            return Ok(VersionConstraint::LessThan(Version::parse(rest)?));
        }

        let exact = s
            .strip_prefix("==")
            .or_else(|| s.strip_prefix('='))
            .unwrap_or(s)
            .trim();
        if let Some(prefix) = exact.strip_suffix(".*") {
            return Ok(VersionConstraint::Prefix(Version::parse(prefix)?));
        }
        Ok(VersionConstraint::Exact(Version::parse(exact)?))
    }

    /// Check if a version satisfies this constraint.
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => {
                if v.release.is_some() {
                    version == v
                } else {
                    version.cmp_loose(v) == Ordering::Equal
                }
            }
            VersionConstraint::Prefix(p) => version.has_prefix(p),
            VersionConstraint::GreaterThan(v) => version > v,
            VersionConstraint::GreaterOrEqual(v) => version >= v,
            VersionConstraint::LessThan(v) => version < v,
            VersionConstraint::LessOrEqual(v) => version <= v,
            VersionConstraint::NotEqual(v) => version != v,
            VersionConstraint::Compatible(v) => version >= v && version.has_prefix(&compatible_prefix(v)),
            VersionConstraint::All(parts) => parts.iter().all(|c| c.satisfies(version)),
        }
    }

    /// Direction `installed` must move in, or `None` if it already satisfies.
    pub fn direction(&self, installed: &Version) -> Option<Direction> {
        if self.satisfies(installed) {
            return None;
        }
        let below = |target: &Version| {
            if installed.cmp_loose(target) == Ordering::Less {
                Direction::Upgrade
            } else {
                Direction::Downgrade
            }
        };
        Some(match self {
            VersionConstraint::Any | VersionConstraint::NotEqual(_) => Direction::Upgrade,
            VersionConstraint::Exact(v) | VersionConstraint::Prefix(v) | VersionConstraint::Compatible(v) => {
                below(v)
            }
            VersionConstraint::GreaterThan(_) | VersionConstraint::GreaterOrEqual(_) => {
                Direction::Upgrade
            }
            VersionConstraint::LessThan(_) | VersionConstraint::LessOrEqual(_) => {
                Direction::Downgrade
            }
            VersionConstraint::All(parts) => {
                return parts.iter().find_map(|c| c.direction(installed));
            }
        })
    }

    /// The single version this constraint pins, if any.
    pub fn pinned(&self) -> Option<&str> {
        match self {
            VersionConstraint::Exact(v) => Some(v.as_str()),
            VersionConstraint::All(parts) => parts.iter().find_map(Self::pinned),
            _ => None,
        }
    }
}

/// `~=1.4.2` keeps everything but the last segment fixed.
fn compatible_prefix(v: &Version) -> Version {
    let mut prefix = v.clone();
    if prefix.upstream.len() > 1 {
        prefix.upstream.pop();
    }
    prefix.release = None;
    prefix
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) => write!(f, "=={v}"),
            VersionConstraint::Prefix(v) => write!(f, "=={v}.*"),
            VersionConstraint::GreaterThan(v) => write!(f, ">{v}"),
            VersionConstraint::GreaterOrEqual(v) => write!(f, ">={v}"),
            VersionConstraint::LessThan(v) => write!(f, "<{v}"),
            VersionConstraint::LessOrEqual(v) => write!(f, "<={v}"),
            VersionConstraint::NotEqual(v) => write!(f, "!={v}"),
            VersionConstraint::Compatible(v) => write!(f, "~={v}"),
            VersionConstraint::All(parts) => {
                let rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "{}", rendered.join(","))
            }
        }
    }
}
