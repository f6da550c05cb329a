pub mod handlers;
pub mod router;
pub mod state;

pub use handlers::ApiError;
pub use router::api_router;
pub use state::AppState;
