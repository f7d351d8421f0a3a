pub mod db;
#[cfg(feature = "memory")]
pub mod memory;
pub mod models;
pub mod repositories;

pub use repositories::Repositories;
pub use sqlx;

use anyhow::Result;

/// Connects, applies pending migrations and returns the PostgreSQL-backed repositories.
pub async fn connect(url: &str, max_connections: u32) -> Result<(sqlx::PgPool, Repositories)> {
    let pool = db::init_db(url, max_connections).await?;
    db::migrate(&pool).await?;
    Ok((pool.clone(), Repositories::postgres(pool)))
}
