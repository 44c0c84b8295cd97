// PostgreSQL storage layer with sqlx
//
// This crate provides database implementations for core traits:
// - Database: implements UserRepository, including the transactional
//   outbox writer used by parent registration

pub mod database;
pub mod models;

pub use database::Database;
pub use models::{OutboxEventRow, UserRow};
