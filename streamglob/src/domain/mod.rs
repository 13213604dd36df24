//! Leaf data supplied by providers: listings and their sources.
//!
//! The task core only reads these, except for the `downloaded` / `viewed`
//! timestamps, which the completion recorder stamps.

mod listing;
mod media_type;
mod source;

pub use listing::Listing;
pub use media_type::MediaType;
pub use source::Source;
