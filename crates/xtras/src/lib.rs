mod actor_name;
pub mod handler_timeout;
mod send_async_next;
mod send_async_safe;
pub mod send_interval;
pub mod supervisor;

pub use actor_name::ActorName;
pub use handler_timeout::HandlerTimeoutExt;
pub use send_async_next::SendAsyncNext;
pub use send_async_safe::SendAsyncSafe;
pub use send_interval::IncludeSpan;
pub use send_interval::SendInterval;
