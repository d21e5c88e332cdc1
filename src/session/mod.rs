//! Sessions and the session pool
//!
//! A session models a single "browser identity": a cookie jar, an error score
//! and a usage budget. The pool keeps a bounded population of them, mints new
//! ones lazily and rotates out sessions that expire, exceed their usage cap
//! or accumulate too many errors.

pub mod cookies;
pub mod pool;
#[allow(clippy::module_inception)]
pub mod session;

pub use cookies::{CookieJar, CookieRecord};
pub use pool::{DEFAULT_PERSIST_STATE_KEY, SessionPool, SessionPoolModel, SessionPoolOptions};
pub use session::{Session, SessionModel, SessionOptions};
