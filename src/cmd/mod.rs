//! CLI command implementations.
//!
//! | Module       | Commands handled |
//! |--------------|------------------|
//! | `run`        | `Run`            |
//! | `session`    | `Session`        |
//! | `transcript` | `Transcript`     |
//! | `config`     | `Config`         |

pub mod config;
pub mod run;
pub mod session;
pub mod transcript;

pub use config::cmd_config;
pub use run::cmd_run;
pub use session::cmd_session;
pub use transcript::cmd_transcript;
