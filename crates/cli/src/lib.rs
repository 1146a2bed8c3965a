//! pacs-retire command line front end
//!
//! The binary in `main.rs` is a thin clap dispatcher over these modules.

pub mod cmd;
pub mod locks;
pub mod logging;
pub mod util;
