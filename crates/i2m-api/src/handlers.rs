//! Request handlers.

pub mod admin;
pub mod download;
pub mod health;
pub mod session;
pub mod status;
pub mod stream;
pub mod upload;

pub use admin::*;
pub use download::*;
pub use health::*;
pub use session::*;
pub use status::*;
pub use stream::*;
pub use upload::*;
