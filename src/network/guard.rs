//! Network State Guard
//!
//! Captures the default route and resolver configuration before a session,
//! applies the session's overrides once the link is up, and restores the
//! captured state exactly once on teardown.
//!
//! Restore claims the snapshot file by renaming it, so when the controller
//! and the ip-down hook race, only one of them performs the restore and the
//! other sees nothing pending. A claim left behind by a restorer that died
//! mid-restore is adopted by the next restore.

use super::resolver::{ResolverError, ResolverFile, ResolverState};
use super::snapshot::{self, NetworkSnapshot, ResolverBackup, SnapshotHandle};
use super::NegotiatedSettings;
use crate::config::{DnsMode, NetworkConfig};
use crate::platform::{get_routing_manager, DefaultRoute, PlatformError, RoutingManager};
use crate::state::{self, StateDir, StateError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("State error: {0}")]
    StateError(#[from] StateError),
    #[error("Resolver error: {0}")]
    ResolverError(#[from] ResolverError),
    #[error("Platform error: {0}")]
    PlatformError(#[from] PlatformError),
    #[error("A snapshot of session {0} is still pending restore")]
    SnapshotPending(String),
    #[error("No snapshot for session {0}")]
    NoSnapshot(String),
}

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreReport {
    /// Another invocation already restored (or nothing was captured)
    NothingPending,
    /// State restored; entries describe parts that no longer matched reality
    Restored { inconsistencies: Vec<String> },
}

pub struct NetworkGuard {
    state_dir: StateDir,
    routing: Box<dyn RoutingManager>,
    resolver: ResolverFile,
    dns_mode: DnsMode,
    static_dns: Vec<IpAddr>,
    replace_default_route: bool,
    cache_reload: Vec<String>,
    liveness: fn(u32) -> bool,
}

impl NetworkGuard {
    pub fn new(config: &NetworkConfig, routing: Box<dyn RoutingManager>) -> Self {
        Self {
            state_dir: StateDir::new(&config.state_dir),
            routing,
            resolver: ResolverFile::with_path(config.resolv_conf.clone()),
            dns_mode: config.dns_mode,
            static_dns: config.static_dns.clone(),
            replace_default_route: config.replace_default_route,
            cache_reload: config.cache_reload.clone(),
            liveness: state::process_alive,
        }
    }

    /// Replace the pid liveness check used to spot abandoned restores
    pub fn with_liveness(mut self, liveness: fn(u32) -> bool) -> Self {
        self.liveness = liveness;
        self
    }

    /// Guard using the platform routing manager
    pub fn from_config(config: &NetworkConfig) -> Result<Self, GuardError> {
        Ok(Self::new(config, get_routing_manager()?))
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.state_dir
    }

    /// Capture pre-session state and persist it
    pub fn snapshot(&self, session_tag: &str) -> Result<SnapshotHandle, GuardError> {
        let default_route = match self.routing.default_route() {
            Ok(route) => route,
            Err(e) => {
                warn!("Could not read default route: {} (assuming none)", e);
                None
            }
        };

        let resolver = match self.dns_mode {
            DnsMode::Native => ResolverBackup::Unmanaged,
            DnsMode::Auto | DnsMode::Override => {
                let follow = self.dns_mode == DnsMode::Override;
                match self.resolver.inspect(follow)? {
                    ResolverState::Symlink => ResolverBackup::Unmanaged,
                    ResolverState::Absent => ResolverBackup::Absent,
                    ResolverState::Present(contents) => ResolverBackup::Saved { contents },
                }
            }
        };

        let snapshot = NetworkSnapshot {
            session_tag: session_tag.to_string(),
            taken_at: state::unix_now(),
            default_route,
            resolver,
            session_route: None,
            dns_overridden: false,
        };

        self.state_dir.ensure()?;
        if let Some(claim) = self.abandoned_claims()?.first() {
            let pending = state::read_json::<NetworkSnapshot>(claim)
                .ok()
                .flatten()
                .map(|s| s.session_tag)
                .unwrap_or_default();
            return Err(GuardError::SnapshotPending(pending));
        }

        let handle = SnapshotHandle::new(&self.state_dir, session_tag);
        if !state::create_json_exclusive(handle.path(), &snapshot)? {
            let pending = snapshot::load_pending(&self.state_dir)?
                .map(|s| s.session_tag)
                .unwrap_or_default();
            return Err(GuardError::SnapshotPending(pending));
        }

        info!(
            "Snapshot taken: route={}, resolver={:?}",
            snapshot
                .default_route
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "(none)".to_string()),
            resolver_kind(&snapshot.resolver)
        );
        Ok(handle)
    }

    /// Install the session's DNS servers and default route
    pub fn apply_overrides(
        &self,
        handle: &SnapshotHandle,
        settings: &NegotiatedSettings,
    ) -> Result<(), GuardError> {
        let mut snapshot = handle
            .load()?
            .ok_or_else(|| GuardError::NoSnapshot(handle.session_tag.clone()))?;

        let servers = if self.static_dns.is_empty() {
            settings.dns_servers.clone()
        } else {
            self.static_dns.clone()
        };

        if snapshot.resolver == ResolverBackup::Unmanaged {
            debug!("Resolver managed natively, leaving it alone");
        } else if servers.is_empty() {
            debug!("No DNS servers to install");
        } else {
            snapshot.dns_overridden = true;
            handle.store(&snapshot)?;
            self.resolver.write_servers(&servers)?;
            info!("Installed DNS servers {:?}", servers);
            self.reload_name_cache();
        }

        if self.replace_default_route {
            let route = DefaultRoute::via_device(&settings.interface);
            snapshot.session_route = Some(route.clone());
            handle.store(&snapshot)?;
            self.routing.set_default_route(&route)?;
            info!("Default route now {}", route);
        }

        Ok(())
    }

    /// Restore the snapshot behind `handle`; a second call is a no-op
    pub fn restore(&self, handle: &SnapshotHandle) -> Result<RestoreReport, GuardError> {
        if handle.load()?.is_some() || !self.abandoned_claims()?.is_empty() {
            return self.restore_pending();
        }
        debug!("No pending snapshot for {}", handle.session_tag);
        Ok(RestoreReport::NothingPending)
    }

    /// Restore whatever snapshot is pending on disk
    ///
    /// Used by crash recovery and by the ip-down hook, which may run after
    /// the controller that took the snapshot has died. Claims abandoned by
    /// a dead restorer are finished first.
    pub fn restore_pending(&self) -> Result<RestoreReport, GuardError> {
        let claimed = snapshot::claim_path(&self.state_dir, std::process::id());
        let mut restored = false;
        let mut inconsistencies = Vec::new();

        for orphan in self.abandoned_claims()? {
            if state::claim(&orphan, &claimed)? {
                info!("Adopting abandoned restore {}", orphan.display());
                restored |= self.restore_claimed(&claimed, &mut inconsistencies)?;
            }
        }

        let path = snapshot::snapshot_path(&self.state_dir);
        if state::claim(&path, &claimed)? {
            restored |= self.restore_claimed(&claimed, &mut inconsistencies)?;
        }

        if !restored {
            return Ok(RestoreReport::NothingPending);
        }
        for note in &inconsistencies {
            warn!("Restore inconsistency: {}", note);
        }
        Ok(RestoreReport::Restored { inconsistencies })
    }

    fn abandoned_claims(&self) -> Result<Vec<PathBuf>, GuardError> {
        Ok(snapshot::abandoned_claims(&self.state_dir, self.liveness)?)
    }

    /// Put back the snapshot this process holds at `claimed`, then drop it
    fn restore_claimed(
        &self,
        claimed: &Path,
        notes: &mut Vec<String>,
    ) -> Result<bool, GuardError> {
        let Some(snapshot) = state::read_json::<NetworkSnapshot>(claimed)? else {
            return Ok(false);
        };

        info!("Restoring network state of {}", snapshot.session_tag);
        self.restore_route(&snapshot, notes);
        self.restore_resolver(&snapshot, notes);

        state::remove(claimed)?;
        Ok(true)
    }

    fn restore_route(&self, snapshot: &NetworkSnapshot, notes: &mut Vec<String>) {
        if let Some(ref route) = snapshot.session_route {
            match self.routing.delete_default_route(route) {
                Ok(()) => info!("Removed session default route {}", route),
                Err(e) => notes.push(format!("session route {} already gone: {}", route, e)),
            }
        }

        let Some(ref original) = snapshot.default_route else {
            return;
        };
        let current = self.routing.default_route().unwrap_or_else(|e| {
            notes.push(format!("could not read default route: {}", e));
            None
        });
        if current.as_ref() == Some(original) {
            return;
        }
        match self.routing.set_default_route(original) {
            Ok(()) => info!("Reinstated default route {}", original),
            Err(e) => notes.push(format!("could not reinstate route {}: {}", original, e)),
        }
    }

    fn restore_resolver(&self, snapshot: &NetworkSnapshot, notes: &mut Vec<String>) {
        let changed = match &snapshot.resolver {
            ResolverBackup::Unmanaged => false,
            ResolverBackup::Saved { contents } => match self.resolver.read() {
                Ok(Some(current)) if current == *contents => false,
                _ => match self.resolver.write(contents) {
                    Ok(()) => {
                        info!("Restored {}", self.resolver.path().display());
                        true
                    }
                    Err(e) => {
                        notes.push(format!("could not restore resolver file: {}", e));
                        false
                    }
                },
            },
            ResolverBackup::Absent => {
                if snapshot.dns_overridden || self.resolver.is_session_file() {
                    match self.resolver.remove() {
                        Ok(removed) => removed,
                        Err(e) => {
                            notes.push(format!("could not remove session resolver file: {}", e));
                            false
                        }
                    }
                } else {
                    false
                }
            }
        };

        if changed || snapshot.dns_overridden {
            self.reload_name_cache();
        }
    }

    /// Ask a local name cache to drop stale entries; failures are harmless
    fn reload_name_cache(&self) {
        let Some((program, args)) = self.cache_reload.split_first() else {
            return;
        };
        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => debug!("Name cache reloaded"),
            Ok(output) => debug!("{} exited with {}", program, output.status),
            Err(e) => debug!("Name cache reload skipped: {}", e),
        }
    }
}

fn resolver_kind(backup: &ResolverBackup) -> &'static str {
    match backup {
        ResolverBackup::Unmanaged => "unmanaged",
        ResolverBackup::Absent => "absent",
        ResolverBackup::Saved { .. } => "saved",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Routing table with a single default route slot
    #[derive(Clone, Default)]
    pub(crate) struct FakeRouting {
        pub current: Arc<Mutex<Option<DefaultRoute>>>,
    }

    impl FakeRouting {
        pub fn with_default(route: DefaultRoute) -> Self {
            Self {
                current: Arc::new(Mutex::new(Some(route))),
            }
        }

        pub fn get(&self) -> Option<DefaultRoute> {
            self.current.lock().unwrap().clone()
        }
    }

    impl RoutingManager for FakeRouting {
        fn default_route(&self) -> Result<Option<DefaultRoute>, PlatformError> {
            Ok(self.get())
        }

        fn set_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError> {
            *self.current.lock().unwrap() = Some(route.clone());
            Ok(())
        }

        fn delete_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError> {
            let mut current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(r) if r.device == route.device => {
                    *current = None;
                    Ok(())
                }
                _ => Err(PlatformError::DeleteRouteError(
                    "RTNETLINK answers: No such process".to_string(),
                )),
            }
        }
    }

    pub(crate) fn lan_route() -> DefaultRoute {
        DefaultRoute {
            gateway: Some("192.168.1.1".parse().unwrap()),
            device: Some("eth0".to_string()),
        }
    }

    pub(crate) fn network_config(dir: &Path, mode: DnsMode) -> NetworkConfig {
        NetworkConfig {
            state_dir: dir.join("state"),
            resolv_conf: dir.join("resolv.conf"),
            dns_mode: mode,
            static_dns: Vec::new(),
            replace_default_route: true,
            cache_reload: Vec::new(),
        }
    }

    pub(crate) fn settings() -> NegotiatedSettings {
        NegotiatedSettings {
            interface: "ppp0".to_string(),
            local: "10.64.1.5".parse().unwrap(),
            remote: "10.64.64.64".parse().unwrap(),
            dns_servers: vec!["10.11.12.13".parse().unwrap()],
        }
    }

    fn guard(dir: &TempDir, mode: DnsMode, routing: &FakeRouting) -> NetworkGuard {
        NetworkGuard::new(
            &network_config(dir.path(), mode),
            Box::new(routing.clone()),
        )
    }

    #[test]
    fn test_round_trip_restores_original_resolver() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 192.168.1.1\n").unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let guard = guard(&dir, DnsMode::Auto, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();

        let during = std::fs::read_to_string(&resolv).unwrap();
        assert!(during.contains("nameserver 10.11.12.13"));
        assert_eq!(routing.get(), Some(DefaultRoute::via_device("ppp0")));

        let report = guard.restore(&handle).unwrap();
        assert!(matches!(report, RestoreReport::Restored { .. }));
        assert_eq!(
            std::fs::read_to_string(&resolv).unwrap(),
            "nameserver 192.168.1.1\n"
        );
        assert_eq!(routing.get(), Some(lan_route()));
    }

    #[test]
    fn test_round_trip_removes_resolver_that_did_not_exist() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Auto, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();
        assert!(resolv.exists());

        guard.restore(&handle).unwrap();
        assert!(!resolv.exists());
        assert_eq!(routing.get(), None);
    }

    #[test]
    fn test_restore_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 192.168.1.1\n").unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let guard = guard(&dir, DnsMode::Auto, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();

        guard.restore(&handle).unwrap();
        let route_once = routing.get();
        let resolv_once = std::fs::read_to_string(&resolv).unwrap();

        assert_eq!(guard.restore(&handle).unwrap(), RestoreReport::NothingPending);
        assert_eq!(routing.get(), route_once);
        assert_eq!(std::fs::read_to_string(&resolv).unwrap(), resolv_once);
    }

    #[test]
    fn test_restore_tolerates_vanished_route() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::with_default(lan_route());
        let guard = guard(&dir, DnsMode::Native, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();

        // Interface disappeared and took every route with it
        *routing.current.lock().unwrap() = None;

        match guard.restore(&handle).unwrap() {
            RestoreReport::Restored { inconsistencies } => {
                assert_eq!(inconsistencies.len(), 1);
                assert!(inconsistencies[0].contains("already gone"));
            }
            other => panic!("Expected Restored, got {:?}", other),
        }
        assert_eq!(routing.get(), Some(lan_route()));
    }

    #[test]
    fn test_native_mode_never_touches_resolver() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 127.0.0.53\n").unwrap();
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Native, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&resolv).unwrap(),
            "nameserver 127.0.0.53\n"
        );

        guard.restore(&handle).unwrap();
        assert_eq!(
            std::fs::read_to_string(&resolv).unwrap(),
            "nameserver 127.0.0.53\n"
        );
    }

    #[test]
    fn test_auto_mode_trusts_symlinked_resolver() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("stub-resolv.conf");
        std::fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("resolv.conf")).unwrap();
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Auto, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();

        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "nameserver 127.0.0.53\n"
        );
        let snapshot = handle.load().unwrap().unwrap();
        assert_eq!(snapshot.resolver, ResolverBackup::Unmanaged);
        assert!(!snapshot.dns_overridden);
    }

    #[test]
    fn test_override_mode_writes_through_symlink_and_restores() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("stub-resolv.conf");
        std::fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("resolv.conf")).unwrap();
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Override, &routing);

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();
        assert!(std::fs::read_to_string(&target)
            .unwrap()
            .contains("10.11.12.13"));

        guard.restore(&handle).unwrap();
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "nameserver 127.0.0.53\n"
        );
    }

    #[test]
    fn test_static_dns_wins_over_negotiated() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::default();
        let mut config = network_config(dir.path(), DnsMode::Auto);
        config.static_dns = vec!["9.9.9.9".parse().unwrap()];
        let guard = NetworkGuard::new(&config, Box::new(routing));

        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert!(content.contains("nameserver 9.9.9.9"));
        assert!(!content.contains("10.11.12.13"));
    }

    #[test]
    fn test_second_snapshot_refused_while_pending() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Native, &routing);

        guard.snapshot("vmc-session.1").unwrap();
        let result = guard.snapshot("vmc-session.2");

        match result {
            Err(GuardError::SnapshotPending(tag)) => assert_eq!(tag, "vmc-session.1"),
            other => panic!("Expected SnapshotPending, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_crash_after_connect_recovered_by_fresh_guard() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let routing = FakeRouting::with_default(lan_route());

        {
            let guard = guard(&dir, DnsMode::Auto, &routing);
            let handle = guard.snapshot("vmc-session.1").unwrap();
            guard.apply_overrides(&handle, &settings()).unwrap();
            // Controller killed here: guard dropped without restore
        }

        let recovering = guard(&dir, DnsMode::Auto, &routing);
        recovering.restore_pending().unwrap();

        assert!(!resolv.exists());
        assert_eq!(routing.get(), Some(lan_route()));
        assert!(snapshot::load_pending(recovering.state_dir()).unwrap().is_none());
    }

    /// Session 1 connected, then its restorer died right after claiming
    fn abandon_restore(dir: &TempDir, routing: &FakeRouting, restorer_pid: u32) {
        let guard = guard(dir, DnsMode::Auto, routing);
        let handle = guard.snapshot("vmc-session.1").unwrap();
        guard.apply_overrides(&handle, &settings()).unwrap();
        std::fs::rename(
            handle.path(),
            snapshot::claim_path(guard.state_dir(), restorer_pid),
        )
        .unwrap();
    }

    #[test]
    fn test_restore_adopts_claim_of_dead_restorer() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let routing = FakeRouting::with_default(lan_route());
        abandon_restore(&dir, &routing, 4242);

        let recovering = guard(&dir, DnsMode::Auto, &routing).with_liveness(|_| false);
        let report = recovering.restore_pending().unwrap();

        assert!(matches!(report, RestoreReport::Restored { .. }));
        assert!(!resolv.exists());
        assert_eq!(routing.get(), Some(lan_route()));
        assert!(!snapshot::claim_path(recovering.state_dir(), 4242).exists());
        assert_eq!(
            recovering.restore_pending().unwrap(),
            RestoreReport::NothingPending
        );
    }

    #[test]
    fn test_restore_leaves_claim_of_live_restorer() {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let routing = FakeRouting::with_default(lan_route());
        abandon_restore(&dir, &routing, 4242);

        let other = guard(&dir, DnsMode::Auto, &routing).with_liveness(|_| true);
        assert_eq!(other.restore_pending().unwrap(), RestoreReport::NothingPending);
        assert!(resolv.exists());
        assert!(snapshot::claim_path(other.state_dir(), 4242).exists());
    }

    #[test]
    fn test_snapshot_refused_while_restore_abandoned() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::with_default(lan_route());
        abandon_restore(&dir, &routing, 4242);

        let next = guard(&dir, DnsMode::Auto, &routing).with_liveness(|_| false);
        match next.snapshot("vmc-session.2") {
            Err(GuardError::SnapshotPending(tag)) => assert_eq!(tag, "vmc-session.1"),
            other => panic!("Expected SnapshotPending, got {:?}", other.map(|_| ())),
        }

        next.restore_pending().unwrap();
        assert!(next.snapshot("vmc-session.2").is_ok());
    }

    #[test]
    fn test_apply_without_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let routing = FakeRouting::default();
        let guard = guard(&dir, DnsMode::Auto, &routing);
        let handle = SnapshotHandle::new(guard.state_dir(), "vmc-session.9");

        assert!(matches!(
            guard.apply_overrides(&handle, &settings()),
            Err(GuardError::NoSnapshot(_))
        ));
    }
}
