pub mod catalog;
pub mod events;
pub mod inserts;
pub mod query;
pub mod run;
pub mod value;

pub use catalog::*;
pub use events::*;
pub use inserts::*;
pub use query::*;
pub use run::*;
pub use value::*;
