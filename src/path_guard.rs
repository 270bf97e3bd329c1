use crate::db::PhotoRecord;
use std::path::Path;

/// Final component of a stored filename, if it is valid UTF-8.
pub fn basename_of(filename: &str) -> Option<&str> {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
}

/// The id and the basename travel separately in a request; the basename must
/// match the record byte for byte before anything is served.
pub fn validate(record: &PhotoRecord, asserted_basename: &str) -> bool {
    match basename_of(&record.filename) {
        Some(basename) => basename.as_bytes() == asserted_basename.as_bytes(),
        None => false,
    }
}
