use axum::Router;
use axum::routing::MethodRouter;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Events,
    Event,
    Tags,
    Tag,
    Raw,
    Show,
    Thumb,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),
    #[error("pattern for {endpoint} must start with '/'")]
    NotAbsolute { endpoint: &'static str },
    #[error("pattern for {endpoint} is missing placeholder {placeholder}")]
    MissingPlaceholder {
        endpoint: &'static str,
        placeholder: &'static str,
    },
    #[error("pattern for {endpoint} has invalid segment {segment:?}")]
    InvalidSegment {
        endpoint: &'static str,
        segment: String,
    },
    #[error("pattern for {endpoint} has a catch-all before its last segment")]
    CatchAllNotLast { endpoint: &'static str },
    #[error("pattern {pattern} for {endpoint} conflicts with {other}")]
    Conflict {
        endpoint: &'static str,
        other: &'static str,
        pattern: String,
    },
}

/// Served by the health check; no endpoint may shadow it.
pub const HEALTHZ_PATH: &str = "/healthz";

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    CatchAll(&'a str),
}

impl Endpoint {
    pub const ALL: [Endpoint; 7] = [
        Endpoint::Events,
        Endpoint::Event,
        Endpoint::Tags,
        Endpoint::Tag,
        Endpoint::Raw,
        Endpoint::Show,
        Endpoint::Thumb,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Events => "events",
            Endpoint::Event => "event",
            Endpoint::Tags => "tags",
            Endpoint::Tag => "tag",
            Endpoint::Raw => "raw",
            Endpoint::Show => "show",
            Endpoint::Thumb => "thumb",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| endpoint.name() == name.trim())
    }

    pub fn default_pattern(self) -> &'static str {
        match self {
            Endpoint::Events => "/",
            Endpoint::Event => "/event/:id/:name",
            Endpoint::Tags => "/tags",
            Endpoint::Tag => "/tag/:name",
            Endpoint::Raw => "/raw/:id/*basename",
            Endpoint::Show => "/show/:id/*basename",
            Endpoint::Thumb => "/thumb/:id/*basename",
        }
    }

    /// Placeholders the handler reads from the path.
    pub fn required_placeholders(self) -> &'static [&'static str] {
        match self {
            Endpoint::Events | Endpoint::Tags => &[],
            Endpoint::Event => &["id"],
            Endpoint::Tag => &["name"],
            Endpoint::Raw | Endpoint::Show | Endpoint::Thumb => &["id", "basename"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    patterns: HashMap<Endpoint, String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            patterns: Endpoint::ALL
                .into_iter()
                .map(|endpoint| (endpoint, endpoint.default_pattern().to_string()))
                .collect(),
        }
    }
}

impl RouteTable {
    /// Layers `overrides` (endpoint name to pattern) over the defaults.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, RouteTableError> {
        let mut table = Self::default();
        for (name, pattern) in overrides {
            let endpoint = Endpoint::from_name(name)
                .ok_or_else(|| RouteTableError::UnknownEndpoint(name.clone()))?;
            table.patterns.insert(endpoint, pattern.trim().to_string());
        }
        let healthz = segments_of(HEALTHZ_PATH);
        let mut checked: Vec<(Endpoint, Vec<Segment<'_>>)> = Vec::new();
        for endpoint in Endpoint::ALL {
            let pattern = table.pattern(endpoint);
            let segments = validate_pattern(endpoint, pattern)?;
            let conflict = if conflicts(&segments, &healthz) {
                Some("healthz")
            } else {
                checked
                    .iter()
                    .find(|(_, other)| conflicts(&segments, other))
                    .map(|(other, _)| other.name())
            };
            if let Some(other) = conflict {
                return Err(RouteTableError::Conflict {
                    endpoint: endpoint.name(),
                    other,
                    pattern: pattern.to_string(),
                });
            }
            checked.push((endpoint, segments));
        }
        Ok(table)
    }

    pub fn pattern(&self, endpoint: Endpoint) -> &str {
        self.patterns
            .get(&endpoint)
            .map(String::as_str)
            .unwrap_or_else(|| endpoint.default_pattern())
    }

    /// Longest pattern first so a bare prefix never shadows a more specific
    /// route; equal lengths fall back to the endpoint name.
    pub fn ordered(&self) -> Vec<(Endpoint, &str)> {
        let mut entries: Vec<(Endpoint, &str)> = Endpoint::ALL
            .into_iter()
            .map(|endpoint| (endpoint, self.pattern(endpoint)))
            .collect();
        entries.sort_by(|(a_endpoint, a_pattern), (b_endpoint, b_pattern)| {
            b_pattern
                .len()
                .cmp(&a_pattern.len())
                .then_with(|| a_endpoint.name().cmp(b_endpoint.name()))
        });
        entries
    }

    pub fn register<S>(
        &self,
        mut router: Router<S>,
        handler_for: impl Fn(Endpoint) -> MethodRouter<S>,
    ) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        for (endpoint, pattern) in self.ordered() {
            router = router.route(&to_axum_path(pattern), handler_for(endpoint));
        }
        router
    }

    /// Fills the placeholders of an endpoint's pattern. Values are
    /// percent-encoded; a catch-all keeps its `/` separators.
    pub fn url_for(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> String {
        let value_of = |name: &str| {
            params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
                .unwrap_or_default()
        };
        self.pattern(endpoint)
            .split('/')
            .map(|segment| match parse_segment(segment) {
                Segment::Literal(literal) => literal.to_string(),
                Segment::Param(name) => encode_segment(value_of(name)),
                Segment::CatchAll(name) => value_of(name)
                    .split('/')
                    .map(encode_segment)
                    .collect::<Vec<_>>()
                    .join("/"),
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Converts `:name` and `*name` segments into axum's `{name}` and `{*name}`.
pub fn to_axum_path(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| match parse_segment(segment) {
            Segment::Literal(literal) => literal.to_string(),
            Segment::Param(name) => format!("{{{name}}}"),
            Segment::CatchAll(name) => format!("{{*{name}}}"),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

fn parse_segment(segment: &str) -> Segment<'_> {
    if let Some(name) = segment.strip_prefix(':') {
        Segment::Param(name)
    } else if let Some(name) = segment.strip_prefix('*') {
        Segment::CatchAll(name)
    } else {
        Segment::Literal(segment)
    }
}

fn segments_of(pattern: &str) -> Vec<Segment<'_>> {
    pattern
        .strip_prefix('/')
        .unwrap_or(pattern)
        .split('/')
        .map(parse_segment)
        .collect()
}

fn segment_text(segment: Segment<'_>) -> String {
    match segment {
        Segment::Literal(literal) => literal.to_string(),
        Segment::Param(name) => format!(":{name}"),
        Segment::CatchAll(name) => format!("*{name}"),
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Whether the router would refuse to hold both patterns. Literals may sit
/// beside parameters; parameters at the same position must share a name and
/// a catch-all admits no sibling.
fn conflicts(a: &[Segment<'_>], b: &[Segment<'_>]) -> bool {
    for (left, right) in a.iter().zip(b) {
        match (left, right) {
            (Segment::CatchAll(_), _) | (_, Segment::CatchAll(_)) => return true,
            (Segment::Literal(left), Segment::Literal(right)) => {
                if left != right {
                    return false;
                }
            }
            (Segment::Literal(_), Segment::Param(_)) | (Segment::Param(_), Segment::Literal(_)) => {
                return false;
            }
            (Segment::Param(left), Segment::Param(right)) => {
                if left != right {
                    return true;
                }
            }
        }
    }
    a.len() == b.len()
}

fn validate_pattern(
    endpoint: Endpoint,
    pattern: &str,
) -> Result<Vec<Segment<'_>>, RouteTableError> {
    if !pattern.starts_with('/') {
        return Err(RouteTableError::NotAbsolute {
            endpoint: endpoint.name(),
        });
    }
    let segments = segments_of(pattern);
    let last = segments.len().saturating_sub(1);
    let mut names = Vec::new();
    for (index, segment) in segments.iter().enumerate() {
        let invalid = || RouteTableError::InvalidSegment {
            endpoint: endpoint.name(),
            segment: segment_text(*segment),
        };
        match segment {
            Segment::Literal(literal) => {
                if literal.contains(&['{', '}'][..]) {
                    return Err(invalid());
                }
            }
            Segment::Param(name) => {
                if !is_placeholder_name(name) {
                    return Err(invalid());
                }
                names.push(*name);
            }
            Segment::CatchAll(name) => {
                if !is_placeholder_name(name) {
                    return Err(invalid());
                }
                if index != last {
                    return Err(RouteTableError::CatchAllNotLast {
                        endpoint: endpoint.name(),
                    });
                }
                names.push(*name);
            }
        }
    }
    for placeholder in endpoint.required_placeholders() {
        if !names.contains(placeholder) {
            return Err(RouteTableError::MissingPlaceholder {
                endpoint: endpoint.name(),
                placeholder,
            });
        }
    }
    Ok(segments)
}
