//! pppd hook handler
//!
//! When pppd runs our hooks we:
//!
//! 1. Parse the hook arguments and environment
//! 2. Check the `ipparam` tag against the locked session
//! 3. On ip-up: publish the link settings for the controller
//! 4. On ip-down: restore the network snapshot, and if the controller is
//!    gone, revoke privileges and release its lock
//!
//! Hooks for links we did not start are ignored. pppd does not care about
//! the hook's exit status, so everything past parsing is best-effort.

use super::env::{HookEnvError, HookKind, PppHookEnv};
use crate::config::Config;
use crate::network::RestoreReport;
use crate::session::{LinkNotice, LockError, SessionContext, SessionError};
use crate::state::StateError;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Hook environment error: {0}")]
    EnvError(#[from] HookEnvError),
    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),
    #[error("Lock error: {0}")]
    LockError(#[from] LockError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
}

/// What the hook did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Link does not belong to the locked session
    Ignored,
    /// Link settings handed to the controller
    LinkPublished,
    /// Snapshot restored on link-down
    Restored {
        restored: bool,
        /// Lock of a dead controller released
        released_lock: bool,
    },
}

/// Entry point for `vmc-connect hook <ip-up|ip-down> ARGS...`
pub fn handle_hook_mode(
    config: &Config,
    kind: HookKind,
    args: &[String],
) -> Result<HookAction, HookError> {
    let env = PppHookEnv::from_env(kind, args)?;
    info!(
        "Hook {:?}: interface={}, tag={:?}",
        env.kind, env.interface, env.session_tag
    );

    let context = SessionContext::from_config(config)?;
    handle_hook(&context, &env)
}

pub fn handle_hook(context: &SessionContext, env: &PppHookEnv) -> Result<HookAction, HookError> {
    let Some(ref tag) = env.session_tag else {
        debug!("No ipparam, not one of our links");
        return Ok(HookAction::Ignored);
    };

    let record = match context.lock.current()? {
        Some(record) if record.session_tag == *tag => record,
        Some(record) => {
            info!(
                "Link {} belongs to {}, locked session is {}; ignoring",
                env.interface, tag, record.session_tag
            );
            return Ok(HookAction::Ignored);
        }
        None => {
            info!("No locked session for {}; ignoring", tag);
            return Ok(HookAction::Ignored);
        }
    };

    match env.kind {
        HookKind::IpUp => {
            let notice = LinkNotice {
                session_tag: tag.clone(),
                settings: env.settings()?,
            };
            notice.store(context.state_dir())?;
            info!("Link up on {} for {}", env.interface, tag);
            Ok(HookAction::LinkPublished)
        }
        HookKind::IpDown => {
            let restored = match context.guard.restore_pending() {
                Ok(RestoreReport::Restored { .. }) => true,
                Ok(RestoreReport::NothingPending) => false,
                Err(e) => {
                    warn!("Restore on link-down failed: {}", e);
                    false
                }
            };
            if let Err(e) = LinkNotice::clear(context.state_dir()) {
                warn!("Could not clear link notice: {}", e);
            }

            let mut released_lock = false;
            if context.lock.is_stale(&record) {
                info!(
                    "Controller pid {} is gone, finishing teardown of {}",
                    record.owner_pid, tag
                );
                if let Err(e) = context.privileges.disable() {
                    warn!("Failed to revoke dial privileges: {}", e);
                }
                context.lock.release_record(&record)?;
                released_lock = true;
            }

            Ok(HookAction::Restored {
                restored,
                released_lock,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsMode, PrivilegeConfig};
    use crate::network::guard::tests::{lan_route, network_config, settings, FakeRouting};
    use crate::network::NetworkGuard;
    use crate::platform::DefaultRoute;
    use crate::privilege::PrivilegeManager;
    use crate::session::ConnectionLock;
    use crate::state::StateDir;
    use std::path::Path;
    use tempfile::TempDir;

    fn context(dir: &Path, routing: &FakeRouting, liveness: fn(u32) -> bool) -> SessionContext {
        let config = network_config(dir, DnsMode::Auto);
        let state_dir = StateDir::new(&config.state_dir);
        SessionContext {
            lock: ConnectionLock::with_liveness(&state_dir, liveness),
            guard: NetworkGuard::new(&config, Box::new(routing.clone())),
            privileges: PrivilegeManager::new(&PrivilegeConfig {
                enabled: false,
                ..PrivilegeConfig::default()
            }),
        }
    }

    fn hook_env(kind: HookKind, tag: Option<&str>) -> PppHookEnv {
        let s = settings();
        PppHookEnv {
            kind,
            interface: s.interface,
            tty: Some("/dev/ttyUSB0".to_string()),
            local: Some(s.local),
            remote: Some(s.remote),
            session_tag: tag.map(str::to_string),
            dns_servers: s.dns_servers,
        }
    }

    #[test]
    fn test_ip_up_publishes_link() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::default();
        let ctx = context(dir.path(), &routing, |_| true);
        ctx.lock.acquire(10, "vmc-session.10.0").unwrap();

        let action = handle_hook(&ctx, &hook_env(HookKind::IpUp, Some("vmc-session.10.0"))).unwrap();

        assert_eq!(action, HookAction::LinkPublished);
        assert_eq!(
            LinkNotice::for_session(ctx.state_dir(), "vmc-session.10.0").unwrap(),
            Some(settings())
        );
    }

    #[test]
    fn test_foreign_tag_ignored() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let ctx = context(dir.path(), &routing, |_| true);
        ctx.lock.acquire(10, "vmc-session.10.0").unwrap();
        let handle = ctx.guard.snapshot("vmc-session.10.0").unwrap();
        ctx.guard.apply_overrides(&handle, &settings()).unwrap();

        let action =
            handle_hook(&ctx, &hook_env(HookKind::IpDown, Some("other-vpn"))).unwrap();

        assert_eq!(action, HookAction::Ignored);
        assert_eq!(routing.get(), Some(DefaultRoute::via_device("ppp0")));
        assert!(handle.load().unwrap().is_some());
    }

    #[test]
    fn test_missing_tag_or_lock_ignored() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::default();
        let ctx = context(dir.path(), &routing, |_| true);

        assert_eq!(
            handle_hook(&ctx, &hook_env(HookKind::IpUp, None)).unwrap(),
            HookAction::Ignored
        );
        assert_eq!(
            handle_hook(&ctx, &hook_env(HookKind::IpUp, Some("vmc-session.1.0"))).unwrap(),
            HookAction::Ignored
        );
        assert!(LinkNotice::load(ctx.state_dir()).unwrap().is_none());
    }

    #[test]
    fn test_ip_down_with_live_controller_keeps_lock() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let ctx = context(dir.path(), &routing, |_| true);
        ctx.lock.acquire(10, "vmc-session.10.0").unwrap();
        let handle = ctx.guard.snapshot("vmc-session.10.0").unwrap();
        ctx.guard.apply_overrides(&handle, &settings()).unwrap();

        let action =
            handle_hook(&ctx, &hook_env(HookKind::IpDown, Some("vmc-session.10.0"))).unwrap();

        assert_eq!(
            action,
            HookAction::Restored {
                restored: true,
                released_lock: false
            }
        );
        assert_eq!(routing.get(), Some(lan_route()));
        assert!(ctx.lock.current().unwrap().is_some());
    }

    #[test]
    fn test_ip_down_after_controller_death_releases_lock() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let ctx = context(dir.path(), &routing, |_| false);
        ctx.lock.acquire(10, "vmc-session.10.0").unwrap();
        let handle = ctx.guard.snapshot("vmc-session.10.0").unwrap();
        ctx.guard.apply_overrides(&handle, &settings()).unwrap();

        let action =
            handle_hook(&ctx, &hook_env(HookKind::IpDown, Some("vmc-session.10.0"))).unwrap();

        assert_eq!(
            action,
            HookAction::Restored {
                restored: true,
                released_lock: true
            }
        );
        assert_eq!(routing.get(), Some(lan_route()));
        assert!(!dir.path().join("resolv.conf").exists());
        assert!(ctx.lock.current().unwrap().is_none());
    }

    #[test]
    fn test_hook_error_display() {
        let err = HookError::EnvError(HookEnvError::MissingVar("PPP_IFACE".to_string()));
        assert!(err.to_string().contains("PPP_IFACE"));
    }
}
