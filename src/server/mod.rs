//! HTTP surface.
//!
//! | Module   | Responsibility                                          |
//! |----------|---------------------------------------------------------|
//! | `api`    | Route handlers, `AppState`, `ApiError`, `Caller`        |
//! | `router` | Wiring components from config, router layers, serving   |

pub mod api;
pub mod router;

pub use api::{ApiError, AppState, Caller, SharedState};
pub use router::{ServerConfig, build_router, build_state, start_server};
