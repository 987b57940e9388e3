use sea_orm::{ConnectOptions, Database as SeaDatabase, DatabaseConnection};
use std::time::Duration;

use crate::config::Config;

/// Initialize the database connection from config.
///
/// In-memory SQLite databases exist per connection, so they are pinned to a
/// single pooled connection that is never recycled.
pub async fn connect(config: &Config) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(&config.database_url);
    opts.connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(config.is_dev());

    if is_in_memory(&config.database_url) {
        opts.max_connections(1).min_connections(1);
    } else {
        opts.max_connections(config.max_db_connections)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800));
    }

    SeaDatabase::connect(opts).await
}

fn is_in_memory(url: &str) -> bool {
    url.starts_with("sqlite") && url.contains(":memory:")
}
