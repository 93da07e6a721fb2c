use libsql::params;
use tempfile::TempDir;

use crate::db::{Database, now_rfc3339};
use crate::migrations::run_migrations;

pub(crate) async fn setup_db() -> (Database, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join(format!("db_{}.sqlite", uuid::Uuid::new_v4()));
    let db = Database::new(db_path.as_path()).await.expect("create db");
    run_migrations(&db).await.expect("migrations");
    (db, dir)
}

pub(crate) async fn insert_tenant(db: &Database, id: &str, owner_email: Option<&str>) {
    let conn = db.connection().await.expect("conn");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO tenants (id, name, owner_user_id, owner_email, created_at, updated_at)
         VALUES (?1, 'Acme Studio', ?2, ?3, ?4, ?4)",
        params![id, format!("owner-{id}"), owner_email, now],
    )
    .await
    .expect("insert tenant");
}
