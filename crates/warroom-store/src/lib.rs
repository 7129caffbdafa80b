pub mod database;
pub mod error;
pub mod gateway;
pub mod incidents;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use gateway::{SqliteGateway, StorageGateway};
