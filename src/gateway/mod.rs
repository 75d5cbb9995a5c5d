//! Gateway server implementation

pub mod audit;
pub mod bouncer;
pub mod rate_limit;
mod router;
mod server;
pub mod service;

pub use bouncer::{Bouncer, Guard, bounce, bearer_token};
pub use rate_limit::{Admission, RateLimiter, limit_access};
pub use router::AppState;
pub use server::Gateway;
pub use service::{AuthGateway, AuthenticatedSession};
