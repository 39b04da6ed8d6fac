//! Authentication module for Inkwell

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    require_admin_secret, require_auth, require_cron_secret, AuthError, AuthUser,
};
