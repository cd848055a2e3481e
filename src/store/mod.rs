//! External task store: transport trait, the Notion-shaped backend, and
//! the resilience wrapper everything else goes through.

pub mod backend;
pub mod notion;
pub mod resilient;

pub use backend::{
    QUERY_PAGE_SIZE, SortDir, SortKey, StoreBackend, TaskFilter, TaskQuery, TaskSort,
};
pub use notion::NotionBackend;
pub use resilient::{Deadline, ResilientStore};
