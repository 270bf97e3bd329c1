use crate::cache::RenditionCache;
use crate::config::RenditionSizes;
use crate::db::Database;
use crate::path_guard::{self, basename_of};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionKind {
    Raw,
    Inline,
    Thumb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub path: PathBuf,
    pub download_name: String,
    pub kind: RenditionKind,
    /// False for raw passthrough and for renditions that fell back to the
    /// original file.
    pub rendered: bool,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("photo not found")]
    NotFound,
    #[error("photo basename does not match")]
    BasenameMismatch,
    #[error("library store unavailable: {0}")]
    Store(#[source] anyhow::Error),
}

/// Turns `(id, basename, kind)` into a file that may be served.
#[derive(Clone)]
pub struct ResourceResolver {
    db: Database,
    cache: RenditionCache,
    sizes: RenditionSizes,
}

impl ResourceResolver {
    pub fn new(db: Database, cache: RenditionCache, sizes: RenditionSizes) -> Self {
        Self { db, cache, sizes }
    }

    pub async fn resolve(
        &self,
        id: i64,
        asserted_basename: &str,
        kind: RenditionKind,
    ) -> Result<ResolvedResource, ResolveError> {
        let record = self
            .db
            .find_photo_by_id(id)
            .await
            .map_err(ResolveError::Store)?
            .ok_or(ResolveError::NotFound)?;

        if !path_guard::validate(&record, asserted_basename) {
            warn!(photo_id = id, asserted = %asserted_basename, "basename mismatch");
            return Err(ResolveError::BasenameMismatch);
        }
        let download_name = basename_of(&record.filename)
            .unwrap_or(asserted_basename)
            .to_string();

        let Some(spec) = self.sizes.spec_for(kind) else {
            return Ok(ResolvedResource {
                path: PathBuf::from(&record.filename),
                download_name,
                kind,
                rendered: false,
            });
        };
        let rendition = self
            .cache
            .get_or_create(Path::new(&record.filename), spec)
            .await;
        Ok(ResolvedResource {
            path: rendition.path,
            download_name,
            kind,
            rendered: rendition.rendered,
        })
    }
}
