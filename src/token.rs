//! Token value objects, cache keys, credentials, and the raw upstream shape.

pub mod credentials;
pub mod key;
pub mod raw;
pub mod record;
pub mod secret;

pub use credentials::*;
pub use key::*;
pub use raw::*;
pub use record::*;
pub use secret::*;
