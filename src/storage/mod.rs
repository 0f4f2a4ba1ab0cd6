pub mod backend;
pub mod mirrored;
pub mod sqlite;

pub use backend::{DataBackend, LocalBackend, ObjectStoreBackend, S3Credentials, StagedFile};
pub use mirrored::{MirroredCatalog, MirroredCatalogHandle};
pub use sqlite::{CatalogStore, SqliteCatalog};
