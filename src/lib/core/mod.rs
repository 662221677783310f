pub mod error;
pub mod message;
pub mod record;
pub mod router;

pub use error::*;
pub use message::*;
pub use record::*;
pub use router::*;
