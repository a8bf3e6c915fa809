use crate::storage::entity::scrape_job;
use log::info;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, Schema,
    Statement,
};
use std::collections::HashSet;
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");

    let mut opt = ConnectOptions::new(db_url.to_owned());
    if in_memory {
        // 每条连接都是独立的内存库，只能用单连接且不能回收
        opt.max_connections(1).min_connections(1);
    } else {
        opt.max_connections(10)
            .min_connections(2)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800));
    }
    opt.connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Info);

    let db = Database::connect(opt).await?;

    if !in_memory {
        db.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
    }

    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let stmt = builder.build(
        schema
            .create_table_from_entity(scrape_job::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;
    ensure_scrape_jobs_columns(&db).await?;

    db.execute(Statement::from_string(
        builder,
        "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_due ON scrape_jobs(schedule_type, is_active, next_run_at);"
            .to_string(),
    ))
    .await?;

    info!("数据库已就绪: {}", db_url);
    Ok(db)
}

/// 旧库补列：只增不改
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("origin_ip", "TEXT NULL"),
    ("origin_verified", "BOOLEAN NULL"),
    ("origin_warning", "TEXT NULL"),
    ("payload_snapshot", "TEXT NULL"),
    ("content_length", "BIGINT NOT NULL DEFAULT 0"),
    ("fallback_used", "BOOLEAN NOT NULL DEFAULT 0"),
    ("estimated_cost_usd", "REAL NOT NULL DEFAULT 0"),
];

async fn ensure_scrape_jobs_columns(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    if backend != DatabaseBackend::Sqlite {
        return Ok(());
    }

    let rows = db
        .query_all(Statement::from_string(
            backend,
            "PRAGMA table_info(scrape_jobs);".to_string(),
        ))
        .await?;

    let mut cols = HashSet::new();
    for row in rows {
        if let Ok(name) = row.try_get::<String>("", "name") {
            cols.insert(name);
        }
    }

    for (name, ddl) in ADDITIVE_COLUMNS {
        if !cols.contains(*name) {
            info!("scrape_jobs 补列: {}", name);
            db.execute(Statement::from_string(
                backend,
                format!("ALTER TABLE scrape_jobs ADD COLUMN {} {};", name, ddl),
            ))
            .await?;
        }
    }

    Ok(())
}
