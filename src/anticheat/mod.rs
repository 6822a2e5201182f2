//! Anti-cheat: action validation, inbound rate limiting and escalating sanctions

pub mod rate_limiter;
pub mod sanctions;
pub mod validator;
