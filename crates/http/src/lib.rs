mod body;
mod router;
mod server;

pub use body::ClosingBody;
pub use router::{MAX_BODY_BYTES, app_router};
pub use server::{bind, serve_http};
