//! pppd hook integration
//!
//! pppd runs `/etc/ppp/ip-up` and `/etc/ppp/ip-down` as separate processes.
//! Both forward to this binary:
//!
//! ```bash
//! #!/bin/sh
//! # /etc/ppp/ip-up.d/vmc-connect
//! exec /usr/bin/vmc-connect hook ip-up "$@"
//! ```
//!
//! The session tag arrives as `ipparam`, so a hook can tell our links from
//! anyone else's.

pub mod env;
pub mod script;

pub use env::{HookEnvError, HookKind, PppHookEnv};
pub use script::{handle_hook_mode, HookAction, HookError};
