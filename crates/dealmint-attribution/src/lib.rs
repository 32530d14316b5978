mod service;
mod token;

pub use service::{Attribution, AttributionService, IssuedClick};
pub use token::{AttributionToken, TokenSigner};
