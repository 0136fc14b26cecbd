//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `dev`    | `Dev`            |
//! | `db`     | `Db`             |
//! | `config` | `Config`         |

pub mod config;
pub mod db;
pub mod dev;
pub mod serve;

pub use config::cmd_config;
pub use db::cmd_db;
pub use dev::cmd_dev;
pub use serve::cmd_serve;
