use crate::config::Config;
use crate::queries::{Query, photos_by_ids_sql};
use crate::tags::decode_photo_id_list;
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;

/// Read-only view of the photo library database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoRecord {
    pub id: i64,
    pub filename: String,
    pub filesize: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub name: Option<String>,
    pub time_created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    pub name: String,
    pub photo_ids: Vec<i64>,
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        Self::open(&config.db_path, config.db_max_connections).await
    }

    pub async fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        if !db_path.exists() {
            return Err(anyhow::anyhow!(
                "library database {} does not exist",
                db_path.display()
            ));
        }
        let db_url = format!("sqlite://{}?mode=ro", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&db_url)
            .await
            .with_context(|| format!("connect to library {}", db_path.display()))?;
        Ok(Self { pool })
    }

    pub async fn find_photo_by_id(&self, id: i64) -> Result<Option<PhotoRecord>> {
        let row = sqlx::query(Query::PhotoById.sql()?)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| photo_from_row(&row)))
    }

    pub async fn find_event_by_id(&self, id: i64) -> Result<Option<EventRecord>> {
        let row = sqlx::query(Query::EventById.sql()?)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| event_from_row(&row)))
    }

    pub async fn list_events(&self) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(Query::AllEvents.sql()?)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    pub async fn list_photos_by_event(&self, event_id: i64) -> Result<Vec<PhotoRecord>> {
        let rows = sqlx::query(Query::PhotosByEvent.sql()?)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(photo_from_row).collect())
    }

    pub async fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let rows = sqlx::query(Query::AllTags.sql()?)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(tag_from_row).collect())
    }

    pub async fn find_tag_by_name(&self, name: &str) -> Result<Option<TagRecord>> {
        let row = sqlx::query(Query::TagByName.sql()?)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| tag_from_row(&row)))
    }

    pub async fn list_photos_by_ids(&self, ids: &[i64]) -> Result<Vec<PhotoRecord>> {
        let Some(sql) = photos_by_ids_sql(ids.len())? else {
            return Ok(Vec::new());
        };
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(photo_from_row).collect())
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn photo_from_row(row: &SqliteRow) -> PhotoRecord {
    PhotoRecord {
        id: row.get("id"),
        filename: row.get("filename"),
        filesize: row.get::<Option<i64>, _>("filesize").unwrap_or(0),
        title: row.get("title"),
    }
}

fn event_from_row(row: &SqliteRow) -> EventRecord {
    EventRecord {
        id: row.get("id"),
        name: row.get("name"),
        time_created: row.get::<Option<i64>, _>("time_created").unwrap_or(0),
    }
}

fn tag_from_row(row: &SqliteRow) -> TagRecord {
    let raw: Option<String> = row.get("photo_id_list");
    TagRecord {
        name: row.get("name"),
        photo_ids: raw.as_deref().map(decode_photo_id_list).unwrap_or_default(),
    }
}
