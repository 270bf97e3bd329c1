use crate::cache::RenditionCache;
use crate::config::Config;
use crate::db::Database;
use crate::resolver::ResourceResolver;
use crate::routes::RouteTable;
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub resolver: ResourceResolver,
    pub routes: RouteTable,
}

impl AppState {
    pub fn new(config: Config, db: Database, cache: RenditionCache) -> Result<Self> {
        let routes = RouteTable::with_overrides(&config.route_overrides)
            .context("invalid ROUTES override")?;
        let resolver = ResourceResolver::new(db.clone(), cache, config.renditions);
        Ok(Self {
            config: Arc::new(config),
            db,
            resolver,
            routes,
        })
    }
}
