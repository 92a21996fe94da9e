mod redis_error;
mod server_error;

pub use redis_error::*;
pub use server_error::*;
