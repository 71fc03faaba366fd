use std::cmp::Ordering;
use std::fmt;

/// A dotted version such as `2.7.1`, `4.3.12r93733` or `1.17-3`.
///
/// Ordering and equality only look at the numeric components.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
    pub misc: String,
    pub raw: String,
}

fn take_number(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

impl Version {
    /// Parse `major.minor[.build][(.|-|r)revision][misc]`. Returns `None`
    /// when there is no `major.minor` prefix.
    pub fn parse(input: &str) -> Option<Self> {
        let raw = input.trim();
        let (major, rest) = take_number(raw)?;
        let rest = rest.strip_prefix('.')?;
        let (minor, mut rest) = take_number(rest)?;

        let mut build = 0;
        if let Some(after) = rest.strip_prefix('.') {
            if let Some((n, tail)) = take_number(after) {
                build = n;
                rest = tail;
            }
        }

        let mut revision = 0;
        for sep in ['.', '-', 'r'] {
            if let Some(after) = rest.strip_prefix(sep) {
                if let Some((n, tail)) = take_number(after) {
                    revision = n;
                    rest = tail;
                }
                break;
            }
        }

        Some(Self {
            major,
            minor,
            build,
            revision,
            misc: rest.to_string(),
            raw: raw.to_string(),
        })
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.build, self.revision)
    }

    /// Compare against a version string; unparsable strings sort lowest.
    pub fn compare_str(&self, other: &str) -> Ordering {
        match Version::parse(other) {
            Some(v) => self.cmp(&v),
            None => Ordering::Greater,
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Pick the newest version listed in a release index (one entry per line or
/// whitespace-separated). Tokens that are not versions are skipped.
pub fn newest_in_index(index: &str) -> Option<Version> {
    index.split_whitespace().filter_map(Version::parse).max()
}
