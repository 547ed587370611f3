pub mod abi;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod contract;
pub mod eip712;
pub mod error;
pub mod fees;
pub mod oracle;
pub mod pipeline;
pub mod rate_limiter;
pub mod server;
pub mod types;
pub mod validation;

pub use config::Config;
pub use error::{RelayError, RelayResult};
pub use pipeline::RelayPipeline;
pub use rate_limiter::RateLimiter;
pub use server::{create_router, AppState, HttpServer};
