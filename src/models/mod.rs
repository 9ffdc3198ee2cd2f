pub mod analysis;
pub mod datasource;
pub mod execution;
pub mod memory;
pub mod message;
pub mod monitoring;
pub mod plan;
pub mod query;
pub mod schema;

pub use analysis::*;
pub use datasource::*;
pub use execution::*;
pub use memory::*;
pub use message::*;
pub use monitoring::*;
pub use plan::*;
pub use query::*;
pub use schema::*;
