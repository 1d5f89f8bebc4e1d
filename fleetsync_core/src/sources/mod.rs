pub mod memory;
pub mod mssql;
pub mod pool;
pub mod rows;
pub mod traits;

pub use pool::{fetch_all, CycleBatch};
pub use traits::{SourceDb, SourceTask};
