use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

const QUERY_SOURCE: &str = include_str!("../queries.sql");
const NAME_PREFIX: &str = "-- name:";
const IDS_MARKER: &str = "{ids}";

static QUERY_CATALOG: OnceLock<HashMap<String, String>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum QueryCatalogError {
    #[error("query {0} missing from catalog")]
    Missing(&'static str),
    #[error("query {0} has no {{ids}} marker")]
    MissingIdsMarker(&'static str),
}

/// Named read-only queries against the library schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    EventById,
    AllEvents,
    PhotosByEvent,
    AllTags,
    TagByName,
    PhotosByIds,
    PhotoById,
}

impl Query {
    pub const ALL: [Query; 7] = [
        Query::EventById,
        Query::AllEvents,
        Query::PhotosByEvent,
        Query::AllTags,
        Query::TagByName,
        Query::PhotosByIds,
        Query::PhotoById,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Query::EventById => "event_by_id",
            Query::AllEvents => "all_events",
            Query::PhotosByEvent => "photos_by_event",
            Query::AllTags => "all_tags",
            Query::TagByName => "tag_by_name",
            Query::PhotosByIds => "photos_by_ids",
            Query::PhotoById => "photo_by_id",
        }
    }

    pub fn sql(self) -> Result<&'static str, QueryCatalogError> {
        catalog()
            .get(self.name())
            .map(String::as_str)
            .ok_or(QueryCatalogError::Missing(self.name()))
    }
}

/// Fails when a named query is absent from the embedded catalog.
pub fn verify_catalog() -> Result<(), QueryCatalogError> {
    for query in Query::ALL {
        query.sql()?;
    }
    Ok(())
}

/// Expands the `{ids}` marker of `photos_by_ids` into `count` placeholders.
/// Returns `None` for an empty id set so no zero-placeholder query is built.
pub fn photos_by_ids_sql(count: usize) -> Result<Option<String>, QueryCatalogError> {
    if count == 0 {
        return Ok(None);
    }
    let template = Query::PhotosByIds.sql()?;
    if !template.contains(IDS_MARKER) {
        return Err(QueryCatalogError::MissingIdsMarker(Query::PhotosByIds.name()));
    }
    let placeholders = vec!["?"; count].join(", ");
    Ok(Some(template.replace(IDS_MARKER, &placeholders)))
}

fn catalog() -> &'static HashMap<String, String> {
    QUERY_CATALOG.get_or_init(|| parse_catalog(QUERY_SOURCE))
}

fn parse_catalog(source: &str) -> HashMap<String, String> {
    let mut queries = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in source.lines() {
        if let Some(name) = line.trim().strip_prefix(NAME_PREFIX) {
            if let Some((name, body)) = current.take() {
                queries.insert(name, finish_body(&body));
            }
            current = Some((name.trim().to_string(), String::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some((name, body)) = current {
        queries.insert(name, finish_body(&body));
    }
    queries
}

fn finish_body(body: &str) -> String {
    body.trim().trim_end_matches(';').trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_query_is_in_the_catalog() {
        for query in Query::ALL {
            let sql = query.sql().unwrap();
            assert!(sql.starts_with("SELECT"), "{} -> {sql}", query.name());
            assert!(!sql.ends_with(';'));
        }
    }

    #[test]
    fn parse_catalog_splits_on_name_headers() {
        let parsed = parse_catalog(
            "-- leading comment\n-- name: one\nSELECT 1;\n\n-- name: two\nSELECT\n  2;\n",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["one"], "SELECT 1");
        assert_eq!(parsed["two"], "SELECT\n  2");
    }

    #[test]
    fn photos_by_ids_expands_placeholders() {
        let sql = photos_by_ids_sql(3).unwrap().unwrap();
        assert!(sql.contains("IN (?, ?, ?)"));
        assert!(!sql.contains(IDS_MARKER));
    }

    #[test]
    fn photos_by_ids_refuses_empty_set() {
        assert!(photos_by_ids_sql(0).unwrap().is_none());
    }
}
