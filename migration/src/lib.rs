//! Database migrations for the playlist sync engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_100000_create_connections;
mod m2026_01_10_100100_create_playlists;
mod m2026_01_10_100200_create_sync_jobs;
mod m2026_01_10_100300_create_sync_logs;
mod m2026_01_10_100400_add_sync_job_active_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_100000_create_connections::Migration),
            Box::new(m2026_01_10_100100_create_playlists::Migration),
            Box::new(m2026_01_10_100200_create_sync_jobs::Migration),
            Box::new(m2026_01_10_100300_create_sync_logs::Migration),
            Box::new(m2026_01_10_100400_add_sync_job_active_guard::Migration),
        ]
    }
}
