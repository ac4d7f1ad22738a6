mod authenticator;
mod claims;
mod jwt;

pub use authenticator::{authenticate, AuthFailure, Principal, SessionAuthenticator};
pub use claims::{Claims, DEFAULT_ROLE};
pub use jwt::JwtValidator;
