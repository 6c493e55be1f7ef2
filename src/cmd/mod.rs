//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                    |
//! |-----------------|-------------------------------------|
//! | `branch`        | `ResolveBranch`                     |
//! | `metadata`      | `Metadata get`, `Metadata decode`   |
//! | `learn`         | `Learn run`, `Preprocess`           |
//! | `config`        | `Config`                            |
//! | `services`      | shared wiring of adapters           |

pub mod branch;
pub mod config;
pub mod learn;
pub mod metadata;
pub mod services;

pub use branch::cmd_resolve_branch;
pub use config::cmd_config;
pub use learn::{cmd_learn_run, cmd_preprocess};
pub use metadata::{cmd_metadata_decode, cmd_metadata_get};
