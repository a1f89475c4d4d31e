//! Authentication module for Siteline

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, require_paid_access, AuthUser};
