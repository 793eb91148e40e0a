//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `validate` | `Validate`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod serve;
pub mod validate;

pub use config::cmd_config;
pub use serve::{ServeOverrides, cmd_serve};
pub use validate::cmd_validate;
