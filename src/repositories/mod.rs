//! Repository layer over the catalog store
//!
//! The streaming core only ever reads the catalog; the append-only history
//! and failure tables are the single write path, and they are best-effort.

pub mod catalog;
pub mod history;
pub mod users;

pub use catalog::CatalogRepository;
pub use history::HistoryRepository;
pub use users::UserRepository;
