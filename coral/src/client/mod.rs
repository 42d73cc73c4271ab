//! The user-facing driver interface: the session, its builder and the row
//! pager.

pub mod pager;
pub mod session;
pub mod session_builder;

pub use pager::QueryPager;
pub use session::{Session, SessionConfig};
pub use session_builder::SessionBuilder;
