pub mod db;
pub mod model;
pub mod schema;

pub use db::{GetResult, Store};
pub use model::{Inserted, SecretPolicy};
