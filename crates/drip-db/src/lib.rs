mod error;
mod models;
mod schema;
mod store;

pub use error::{DbError, Result};
pub use models::*;
pub use store::DripDb;
