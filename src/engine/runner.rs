use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::actions;
use super::preflight;
use super::types::{Action, PreflightError, RunReport, RunStatus};
use crate::cancel::CancellationFlag;
use crate::config::RunOptions;
use crate::constants::SSH_PORT;
use crate::remote::{Dialer, IdentityCache, SessionSettings};
use crate::state::{load_state, save_state, FailedNodeSoftware, Loaded, RollbackSession};
use crate::topology::Topology;

type Resolver = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct RunState {
    failed: FailedNodeSoftware,
    rollback: RollbackSession,
    resume: bool,
    suffix: String,
    /// An upgrade touched remote files; the session is kept so a resume
    /// reuses the same suffix even if no pair succeeded.
    upgrade_attempted: bool,
}

/// Writes the run state back when dropped, whatever ended the run.
///
/// A registry that ends empty is not written; if it was read from disk at
/// the start of the run, the now-stale file is removed instead.
struct PersistGuard {
    state: RunState,
    failed_path: PathBuf,
    rollback_path: PathBuf,
    failed_on_disk: bool,
    rollback_on_disk: bool,
}

impl PersistGuard {
    fn new(options: &RunOptions) -> Self {
        Self {
            state: RunState {
                failed: FailedNodeSoftware::default(),
                rollback: RollbackSession::new(&options.rollback_suffix, options.action.as_str()),
                resume: false,
                suffix: options.rollback_suffix.clone(),
                upgrade_attempted: false,
            },
            failed_path: options.failed_nodes_path.clone(),
            rollback_path: options.rollback_path.clone(),
            failed_on_disk: false,
            rollback_on_disk: false,
        }
    }
}

impl Drop for PersistGuard {
    fn drop(&mut self) {
        persist(
            &self.failed_path,
            &self.state.failed,
            self.state.failed.is_empty(),
            self.failed_on_disk,
            "failed upgrade information",
        );
        persist(
            &self.rollback_path,
            &self.state.rollback,
            self.state.rollback.is_empty() && !self.state.upgrade_attempted,
            self.rollback_on_disk,
            "rollback session",
        );
    }
}

fn persist<T: Serialize>(path: &Path, value: &T, empty: bool, on_disk: bool, what: &str) {
    if !empty {
        match save_state(path, value) {
            Ok(()) => tracing::info!(path = %path.display(), "saved {what}"),
            Err(err) => tracing::error!(
                path = %path.display(),
                error = %format!("{err:#}"),
                "Unable to save the {what}"
            ),
        }
        return;
    }
    if on_disk {
        match fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed resolved {what}"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "Unable to remove the {what}"),
        }
    }
}

/// Walks the topology group by group and applies one action to every
/// selected (node, software) pair, one pair at a time.
pub struct Engine {
    topology: Topology,
    options: RunOptions,
    identities: IdentityCache,
    cancel: CancellationFlag,
    resolver: Resolver,
}

impl Engine {
    pub fn new(
        topology: Topology,
        options: RunOptions,
        dialer: Arc<dyn Dialer>,
        cancel: CancellationFlag,
    ) -> Self {
        let settings = SessionSettings {
            timeout: options.resolve_ssh_timeout(topology.common.ssh_timeout),
            keepalive_interval: options.keepalive_interval,
            port: SSH_PORT,
        };
        Self {
            topology,
            options,
            identities: IdentityCache::new(dialer, settings),
            cancel,
            resolver: Box::new(preflight::resolves),
        }
    }

    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.resolver = Box::new(resolver);
        self
    }

    /// Runs the pre-flight checks and the main loop. Precondition failures
    /// come back as `PreflightError`; per-pair failures are only logged and
    /// counted in the report. Cached connections are closed before returning.
    pub fn run(&mut self) -> Result<RunReport> {
        let result = self.run_guarded();
        self.identities.clear_all();
        result
    }

    fn run_guarded(&mut self) -> Result<RunReport> {
        let action = self.options.action;
        tracing::info!(
            action = %action,
            groups = ?self.topology.group_names(),
            nodes = self.topology.node_count(),
            dry_run = self.options.dry_run,
            "starting run"
        );

        if self.options.verify_sources {
            preflight::verify_sources(&self.topology)?;
        }
        if self.options.verify_nodes {
            preflight::verify_nodes(&self.topology, self.resolver.as_ref())?;
        }
        if self.options.verify_target_dirs || action == Action::Add {
            preflight::verify_target_dirs(
                &self.topology,
                action,
                &mut self.identities,
                &self.cancel,
            )?;
        }

        let mut guard = PersistGuard::new(&self.options);
        self.init_state(&mut guard)?;
        let report = self.execute(&mut guard.state);
        tracing::info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "{action} {}",
            report.status
        );
        Ok(report)
    }

    fn init_state(&self, guard: &mut PersistGuard) -> Result<()> {
        let action = self.options.action;
        match action {
            Action::Add => {}
            Action::Rollback | Action::DeleteRollback => {
                let path = &self.options.rollback_path;
                match load_state::<RollbackSession>(path)? {
                    Loaded::Missing => {
                        return Err(PreflightError::MissingStateFile {
                            action,
                            path: path.clone(),
                        }
                        .into());
                    }
                    Loaded::Corrupt(reason) => {
                        discard(&mut guard.state);
                        return Err(PreflightError::CorruptState {
                            path: path.clone(),
                            reason,
                        }
                        .into());
                    }
                    Loaded::Present(session) => {
                        guard.state.suffix = session.session_suffix.clone();
                        guard.state.rollback = session;
                        guard.rollback_on_disk = true;
                    }
                }
            }
            Action::ResumeUpgrade => {
                let path = &self.options.failed_nodes_path;
                match load_state::<FailedNodeSoftware>(path)? {
                    Loaded::Missing => {
                        return Err(PreflightError::MissingStateFile {
                            action,
                            path: path.clone(),
                        }
                        .into());
                    }
                    Loaded::Corrupt(reason) => {
                        discard(&mut guard.state);
                        return Err(PreflightError::CorruptState {
                            path: path.clone(),
                            reason,
                        }
                        .into());
                    }
                    Loaded::Present(failed) => {
                        guard.state.failed = failed;
                        guard.state.resume = true;
                        guard.failed_on_disk = true;
                        self.adopt_rollback_session(guard)?;
                    }
                }
            }
            Action::Upgrade => {
                let path = &self.options.failed_nodes_path;
                match load_state::<FailedNodeSoftware>(path)? {
                    Loaded::Present(failed) if !failed.is_empty() => {
                        tracing::warn!(
                            path = %path.display(),
                            pending = failed.len(),
                            "previous run left pending work; resuming it"
                        );
                        guard.state.failed = failed;
                        guard.state.resume = true;
                        guard.failed_on_disk = true;
                        self.adopt_rollback_session(guard)?;
                    }
                    previous => {
                        match previous {
                            Loaded::Corrupt(reason) => {
                                tracing::warn!(path = %path.display(), %reason, "ignoring unreadable failed nodes file");
                                guard.failed_on_disk = true;
                            }
                            Loaded::Present(_) => guard.failed_on_disk = true,
                            Loaded::Missing => {}
                        }
                        tracing::info!("Building node software list...");
                        for (node, software) in self.topology.pairs() {
                            guard.state.failed.add(&node, &software);
                        }
                        tracing::info!(pairs = guard.state.failed.len(), "Node software list built.");
                    }
                }
            }
        }
        Ok(())
    }

    /// A resumed upgrade keeps adding to the rollback session of the run it
    /// resumes, so backups keep one suffix.
    fn adopt_rollback_session(&self, guard: &mut PersistGuard) -> Result<()> {
        let path = &self.options.rollback_path;
        match load_state::<RollbackSession>(path)? {
            Loaded::Present(session) => {
                tracing::info!(suffix = %session.session_suffix, "continuing rollback session");
                guard.state.suffix = session.session_suffix.clone();
                guard.state.rollback = session;
                guard.rollback_on_disk = true;
            }
            Loaded::Corrupt(reason) => {
                tracing::warn!(path = %path.display(), %reason, "starting a new rollback session");
            }
            Loaded::Missing => {}
        }
        Ok(())
    }

    fn execute(&mut self, state: &mut RunState) -> RunReport {
        let Engine {
            topology,
            options,
            identities,
            cancel,
            ..
        } = self;
        let action = options.action;
        let mut report = RunReport::default();

        for name in topology.group_names() {
            if cancel.is_cancelled() {
                break;
            }
            let nodes = topology.group_nodes(name);
            if nodes.is_empty() {
                tracing::info!("No nodes for software group: {name}");
                continue;
            }
            tracing::info!("Performing {action} for software group: {name}");

            let mut processed_any = false;
            'nodes: for node in nodes {
                for software in topology.group_software(name) {
                    if cancel.is_cancelled() {
                        break 'nodes;
                    }
                    if action == Action::Rollback
                        && !state.rollback.rollback_info.contains(node, software)
                    {
                        report.skipped += 1;
                        continue;
                    }
                    if state.resume && !state.failed.contains(node, software) {
                        tracing::debug!("Skipping software {software} for node {node}");
                        report.skipped += 1;
                        continue;
                    }

                    processed_any = true;
                    report.processed += 1;
                    if process_pair(topology, options, identities, state, node, software) {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            let pause = topology.common.group_pause;
            if processed_any && !pause.is_zero() {
                tracing::info!("Pausing for {}...", humantime::format_duration(pause));
                cancel.sleep(pause);
            }
        }

        report.status = if cancel.is_cancelled() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        report
    }
}

fn discard(state: &mut RunState) {
    state.failed.clear();
    state.rollback.clear();
}

/// Stop, act, start. Returns whether every step succeeded. Nothing here
/// escapes the pair: failures are logged and the loop moves on.
fn process_pair(
    topology: &Topology,
    options: &RunOptions,
    identities: &mut IdentityCache,
    state: &mut RunState,
    node: &str,
    software: &str,
) -> bool {
    let action = options.action;
    let info = match topology.node_upgrade_info(node, software) {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(node, software, error = %format!("{err:#}"), "no usable operation descriptor");
            return false;
        }
    };
    match action {
        Action::Add => tracing::info!("Adding software: {software} to node: {node}"),
        Action::DeleteRollback => {
            tracing::info!("Deleting rollback for software: {software} from node: {node}")
        }
        Action::ResumeUpgrade => {
            tracing::info!("Resuming upgrade for node: {node} with software: {software}")
        }
        Action::Rollback => tracing::info!("Rolling back software: {software} for node: {node}"),
        Action::Upgrade => tracing::info!("Upgrading node: {node} with software: {software}"),
    }

    let suffix = state.suffix.as_str();
    let session = identities.get_or_create(&info.ssh_user, &info.ssh_key, node);

    if action.brackets_service() {
        match session.run(&info.render(&info.stop_cmd, suffix)) {
            Ok(output) => tracing::info!(node, software, output = %output.trim(), "stop"),
            Err(err) => {
                tracing::warn!(node, software, error = %err, "stop failed; skipping");
                return false;
            }
        }
    }

    let mut ok = true;
    if !options.dry_run {
        let outcome = match action {
            Action::Add => actions::add(session, &info, suffix),
            Action::DeleteRollback => actions::delete_rollback(session, &info, suffix),
            Action::Rollback => {
                actions::rollback(session, &info, suffix, &state.rollback.new_files)
            }
            Action::Upgrade | Action::ResumeUpgrade => {
                state.upgrade_attempted = true;
                actions::upgrade(session, &info, suffix, &mut state.rollback.new_files)
            }
        };
        match outcome {
            Ok(()) => {
                tracing::info!(node, software, "{action} succeeded");
                if action == Action::Rollback {
                    state.rollback.rollback_info.remove(node, software);
                    for item in &info.copy {
                        state.rollback.new_files.remove(node, &item.dest);
                    }
                } else if action.is_upgrade() {
                    state.failed.remove(node, software);
                    state.rollback.rollback_info.add(node, software);
                }
            }
            Err(err) => {
                tracing::error!(node, software, error = %format!("{err:#}"), "{action} failed");
                ok = false;
            }
        }
    }

    if action.brackets_service() {
        match session.run(&info.render(&info.start_cmd, suffix)) {
            Ok(output) => tracing::info!(node, software, output = %output.trim(), "start"),
            Err(err) => {
                tracing::warn!(node, software, error = %err, "start failed");
                ok = false;
            }
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_test_key, ScriptedDialer};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        dialer: ScriptedDialer,
        cancel: CancellationFlag,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            fs::write(dir.path().join("appA.bin"), b"appA v2").expect("write appA");
            fs::write(dir.path().join("appB.bin"), b"appB v2").expect("write appB");
            write_test_key(dir.path());
            // A fresh suffix has no backups yet.
            let dialer = ScriptedDialer::default();
            dialer.missing_path("n1", "/opt/appA/appA.S1");
            dialer.missing_path("n2", "/opt/appB/appB.S1");
            Self {
                dir,
                dialer,
                cancel: CancellationFlag::new(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn topology(&self, appa_extra: &str) -> Topology {
            self.topology_with("", appa_extra)
        }

        /// g1: [n1] x [appA], g2: [n2] x [appB]. `common` is spliced in front
        /// of the groups and `appa_extra` into appA's descriptor.
        fn topology_with(&self, common: &str, appa_extra: &str) -> Topology {
            let root = self.dir.path().display();
            let json = format!(
                r#"{{
                    {common}
                    "groups": [
                        {{ "name": "g1", "nodes": ["n1"], "software": ["appA"] }},
                        {{ "name": "g2", "nodes": ["n2"], "software": ["appB"] }}
                    ],
                    "software": {{
                        "appA": {{
                            {appa_extra}
                            "ssh_user": "ops", "ssh_key": "{root}/id_test",
                            "stop_cmd": "systemctl stop appA",
                            "start_cmd": "systemctl start appA",
                            "copy": [{{ "source": "{root}/appA.bin", "dest": "/opt/appA/appA", "permissions": "0755" }}],
                            "install_cmd": "echo installed {{software}}",
                            "upgrade_cmd": "echo upgraded {{software}} {{suffix}}",
                            "rollback_cmd": "echo rolled back {{software}}"
                        }},
                        "appB": {{
                            "ssh_user": "ops", "ssh_key": "{root}/id_test",
                            "stop_cmd": "systemctl stop appB",
                            "start_cmd": "systemctl start appB",
                            "copy": [{{ "source": "{root}/appB.bin", "dest": "/opt/appB/appB", "permissions": "0755" }}],
                            "upgrade_cmd": "echo upgraded {{software}} {{suffix}}"
                        }}
                    }}
                }}"#
            );
            Topology::from_slice(json.as_bytes()).expect("topology")
        }

        fn options(&self, action: Action) -> RunOptions {
            let mut options = RunOptions::new(action);
            options.dry_run = false;
            options.rollback_suffix = "S1".to_string();
            options.failed_nodes_path = self.path("Upgrade-Failed.session");
            options.rollback_path = self.path("Upgrade-Rollback.session");
            options
        }

        fn engine_with(&self, topology: Topology, options: RunOptions) -> Engine {
            Engine::new(
                topology,
                options,
                Arc::new(self.dialer.clone()),
                self.cancel.clone(),
            )
            .with_resolver(|_| true)
        }

        fn engine(&self, action: Action) -> Engine {
            self.engine_with(self.topology(""), self.options(action))
        }

        fn failed_file(&self) -> Option<FailedNodeSoftware> {
            match load_state(&self.path("Upgrade-Failed.session")).expect("load") {
                Loaded::Present(failed) => Some(failed),
                _ => None,
            }
        }

        fn rollback_file(&self) -> Option<RollbackSession> {
            match load_state(&self.path("Upgrade-Rollback.session")).expect("load") {
                Loaded::Present(session) => Some(session),
                _ => None,
            }
        }

        fn write_rollback(&self, suffix: &str, pairs: &[(&str, &str)]) {
            let mut session = RollbackSession::new(suffix, "upgrade");
            for (node, software) in pairs {
                session.rollback_info.add(node, software);
            }
            save_state(&self.path("Upgrade-Rollback.session"), &session).expect("save");
        }

        fn ran(&self, host: &str, needle: &str) -> bool {
            self.dialer
                .commands(host)
                .iter()
                .any(|command| command.contains(needle))
        }
    }

    fn pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(node, software)| (node.to_string(), software.to_string()))
            .collect()
    }

    fn preflight_error(err: &anyhow::Error) -> &PreflightError {
        err.downcast_ref::<PreflightError>()
            .unwrap_or_else(|| panic!("expected a pre-flight error, got {err:#}"))
    }

    #[test]
    fn dry_run_only_stops_and_starts() {
        let fx = Fixture::new();
        let mut options = fx.options(Action::Upgrade);
        options.dry_run = true;
        let report = fx.engine_with(fx.topology(""), options).run().expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.processed, 2);
        assert_eq!(
            fx.dialer.commands("n1"),
            vec!["stat '/opt/appA'", "systemctl stop appA", "systemctl start appA"]
        );
        assert!(fx.dialer.uploads().is_empty());
        assert!(!fx
            .dialer
            .all_commands()
            .iter()
            .any(|(_, command)| command.contains("mv -f") || command.contains("upgraded")));
        assert_eq!(
            fx.failed_file().expect("pending work kept").pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
        assert!(fx.rollback_file().is_none());
    }

    #[test]
    fn fresh_upgrade_moves_every_pair_to_the_rollback_session() {
        let fx = Fixture::new();
        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.succeeded, report.failed), (2, 0));
        assert_eq!(
            fx.dialer.commands("n1"),
            vec![
                "stat '/opt/appA'",
                "systemctl stop appA",
                "stat '/opt/appA/appA.S1'",
                "stat '/opt/appA/appA'",
                "sudo mv -f '/opt/appA/appA' '/opt/appA/appA.S1'",
                "sudo /usr/bin/scp -t '/opt/appA'",
                "echo upgraded appA S1",
                "systemctl start appA",
            ]
        );
        assert_eq!(fx.dialer.uploads()[0].payload, b"C0755 7 appA\nappA v2\0".to_vec());
        assert_eq!(fx.dialer.dial_count(), 2);

        assert!(fx.failed_file().is_none());
        let session = fx.rollback_file().expect("rollback session persisted");
        assert_eq!(session.session_suffix, "S1");
        assert_eq!(session.mode, "upgrade");
        assert_eq!(
            session.rollback_info.pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
    }

    #[test]
    fn failed_stop_skips_the_pair_without_aborting() {
        let fx = Fixture::new();
        fx.dialer.fail_command("n1", "systemctl stop appA");
        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert!(!fx.ran("n1", "scp -t"));
        assert!(!fx.ran("n1", "systemctl start appA"));
        assert!(fx.ran("n2", "systemctl start appB"));

        assert_eq!(fx.failed_file().expect("failed").pairs(), pairs(&[("n1", "appA")]));
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n2", "appB")])
        );
    }

    #[test]
    fn failed_action_keeps_pair_pending_and_still_starts() {
        let fx = Fixture::new();
        fx.dialer.fail_command("n2", "echo upgraded");
        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert!(fx.ran("n2", "systemctl start appB"));
        assert_eq!(fx.failed_file().expect("failed").pairs(), pairs(&[("n2", "appB")]));
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n1", "appA")])
        );
    }

    #[test]
    fn checksum_mismatch_fails_the_pair() {
        let fx = Fixture::new();
        fx.dialer.respond("sha256sum", "0000  /opt/appA/appA\n");
        let topology = fx.topology(r#""verify_checksum": true,"#);
        let report = fx
            .engine_with(topology, fx.options(Action::Upgrade))
            .run()
            .expect("run");

        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert!(fx.ran("n1", "sha256sum '/opt/appA/appA'"));
        assert_eq!(fx.failed_file().expect("failed").pairs(), pairs(&[("n1", "appA")]));
    }

    #[test]
    fn matching_checksum_passes() {
        let fx = Fixture::new();
        let digest = crate::util::sha256_file(&fx.path("appA.bin")).expect("hash");
        fx.dialer.respond("sha256sum", &format!("{digest}  /opt/appA/appA\n"));
        let topology = fx.topology(r#""verify_checksum": true,"#);
        let report = fx
            .engine_with(topology, fx.options(Action::Upgrade))
            .run()
            .expect("run");
        assert_eq!((report.succeeded, report.failed), (2, 0));
    }

    #[test]
    fn rollback_only_touches_recorded_pairs() {
        let fx = Fixture::new();
        fx.write_rollback("OLD", &[("n1", "appA")]);
        let report = fx.engine(Action::Rollback).run().expect("run");

        assert_eq!((report.processed, report.skipped), (1, 1));
        assert!(fx.ran("n1", "sudo mv -f '/opt/appA/appA.OLD' '/opt/appA/appA'"));
        assert!(fx.ran("n1", "echo rolled back appA"));
        assert!(!fx.ran("n2", "systemctl stop appB"));
        assert!(fx.rollback_file().is_none());
    }

    #[test]
    fn rollback_removes_only_files_the_upgrade_introduced() {
        let fx = Fixture::new();
        fx.dialer.missing_path("n1", "/opt/appA/appA");
        fx.engine(Action::Upgrade).run().expect("upgrade");
        assert!(!fx.ran("n1", "mv -f"));
        let session = fx.rollback_file().expect("rollback");
        assert!(session.new_files.contains("n1", "/opt/appA/appA"));
        assert!(!session.new_files.contains("n2", "/opt/appB/appB"));

        fx.dialer.restore_path("n2", "/opt/appB/appB.S1");
        let report = fx.engine(Action::Rollback).run().expect("rollback");
        assert_eq!((report.succeeded, report.failed), (2, 0));
        assert!(fx.ran("n1", "sudo rm -f '/opt/appA/appA'"));
        assert!(fx.ran("n2", "sudo mv -f '/opt/appB/appB.S1' '/opt/appB/appB'"));
        assert!(!fx.ran("n2", "sudo rm -f"));
        assert!(fx.rollback_file().is_none());
    }

    #[test]
    fn rollback_after_delete_rollback_keeps_the_live_file() {
        let fx = Fixture::new();
        fx.write_rollback("OLD", &[("n1", "appA")]);
        fx.engine(Action::DeleteRollback).run().expect("delete rollback");
        assert!(fx.ran("n1", "sudo rm -f '/opt/appA/appA.OLD'"));
        assert!(fx.rollback_file().is_some());

        fx.dialer.missing_path("n1", "/opt/appA/appA.OLD");
        let report = fx.engine(Action::Rollback).run().expect("rollback");
        assert_eq!((report.processed, report.failed), (1, 1));
        assert!(!fx.ran("n1", "sudo rm -f '/opt/appA/appA'"));
        assert!(!fx.ran("n1", "echo rolled back"));
        assert!(fx.ran("n1", "systemctl start appA"));
        assert_eq!(
            fx.rollback_file().expect("kept").rollback_info.pairs(),
            pairs(&[("n1", "appA")])
        );
    }

    #[test]
    fn delete_rollback_removes_backups_without_stopping() {
        let fx = Fixture::new();
        fx.write_rollback("OLD", &[("n1", "appA"), ("n2", "appB")]);
        let report = fx.engine(Action::DeleteRollback).run().expect("run");

        assert_eq!(report.succeeded, 2);
        assert!(fx.ran("n1", "sudo rm -f '/opt/appA/appA.OLD'"));
        assert!(fx.ran("n2", "sudo rm -f '/opt/appB/appB.OLD'"));
        assert!(!fx.ran("n1", "systemctl stop"));
        assert_eq!(fx.rollback_file().expect("kept").session_suffix, "OLD");
    }

    #[test]
    fn rollback_requires_a_session_file() {
        let fx = Fixture::new();
        let err = fx.engine(Action::Rollback).run().expect_err("missing file");
        assert!(matches!(
            preflight_error(&err),
            PreflightError::MissingStateFile { action: Action::Rollback, .. }
        ));
        assert!(!fx.ran("n1", "systemctl stop"));
    }

    #[test]
    fn corrupt_rollback_session_is_discarded_not_rewritten() {
        let fx = Fixture::new();
        fs::write(fx.path("Upgrade-Rollback.session"), "{ oops").expect("write");
        let err = fx.engine(Action::Rollback).run().expect_err("corrupt");
        assert!(matches!(preflight_error(&err), PreflightError::CorruptState { .. }));
        assert_eq!(
            fs::read_to_string(fx.path("Upgrade-Rollback.session")).expect("read"),
            "{ oops"
        );
        assert!(fx.failed_file().is_none());
    }

    #[test]
    fn add_creates_missing_directories_even_when_verification_is_off() {
        let fx = Fixture::new();
        fx.dialer.missing_path("n1", "/opt/appA");
        let mut options = fx.options(Action::Add);
        options.verify_target_dirs = false;
        let report = fx.engine_with(fx.topology(""), options).run().expect("run");

        assert_eq!(report.succeeded, 2);
        assert!(fx.ran("n1", "sudo mkdir -p '/opt/appA'"));
        assert!(fx.ran("n1", "echo installed appA"));
        assert!(!fx.ran("n1", "systemctl stop"));
        assert_eq!(fx.dialer.uploads().len(), 2);
    }

    #[test]
    fn missing_target_directory_blocks_upgrade() {
        let fx = Fixture::new();
        fx.dialer.missing_path("n2", "/opt/appB");
        let err = fx.engine(Action::Upgrade).run().expect_err("missing dir");
        let PreflightError::TargetDirectories(problems) = preflight_error(&err) else {
            panic!("unexpected error {err:#}");
        };
        assert_eq!(problems, &vec!["Remote directory: /opt/appB doesn't exist on node: n2".to_string()]);
        assert!(!fx.ran("n1", "systemctl stop"));
        assert!(fx.failed_file().is_none());
    }

    #[test]
    fn connection_errors_are_reported_once_per_message() {
        let fx = Fixture::new();
        fx.dialer.refuse("n1");
        fx.dialer.refuse("n2");
        let err = fx.engine(Action::Upgrade).run().expect_err("refused");
        let PreflightError::TargetDirectories(problems) = preflight_error(&err) else {
            panic!("unexpected error {err:#}");
        };
        assert_eq!(problems.len(), 2);
        assert!(problems[0].starts_with("Node: n1 error:"));
    }

    #[test]
    fn unresolvable_nodes_are_aggregated() {
        let fx = Fixture::new();
        let mut engine = fx
            .engine(Action::Upgrade)
            .with_resolver(|node| node != "n1" && node != "n2");
        let err = engine.run().expect_err("unresolvable");
        assert_eq!(err.to_string(), "Can't resolve n1\nCan't resolve n2");
        assert_eq!(fx.dialer.dial_count(), 0);
    }

    #[test]
    fn missing_sources_abort_before_any_connection() {
        let fx = Fixture::new();
        fs::remove_file(fx.path("appB.bin")).expect("remove");
        let err = fx.engine(Action::Upgrade).run().expect_err("missing source");
        assert!(matches!(preflight_error(&err), PreflightError::MissingSources(missing) if missing == &vec![fx.path("appB.bin")]));
        assert_eq!(fx.dialer.dial_count(), 0);
    }

    #[test]
    fn leftover_failed_file_makes_upgrade_resume() {
        let fx = Fixture::new();
        let mut pending = FailedNodeSoftware::default();
        pending.add("n2", "appB");
        save_state(&fx.path("Upgrade-Failed.session"), &pending).expect("save");
        fx.write_rollback("S0", &[("n1", "appA")]);
        fx.dialer.missing_path("n2", "/opt/appB/appB.S0");

        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!((report.processed, report.skipped), (1, 1));
        assert!(!fx.ran("n1", "systemctl stop"));
        assert!(fx.ran("n2", "sudo mv -f '/opt/appB/appB' '/opt/appB/appB.S0'"));
        assert!(fx.failed_file().is_none());
        assert!(!fx.path("Upgrade-Failed.session").exists());
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
    }

    #[test]
    fn resume_requires_the_failed_file() {
        let fx = Fixture::new();
        let err = fx.engine(Action::ResumeUpgrade).run().expect_err("missing");
        assert!(matches!(
            preflight_error(&err),
            PreflightError::MissingStateFile { action: Action::ResumeUpgrade, .. }
        ));
    }

    #[test]
    fn explicit_resume_processes_only_pending_pairs() {
        let fx = Fixture::new();
        let mut pending = FailedNodeSoftware::default();
        pending.add("n1", "appA");
        save_state(&fx.path("Upgrade-Failed.session"), &pending).expect("save");

        let report = fx.engine(Action::ResumeUpgrade).run().expect("run");
        assert_eq!((report.processed, report.skipped), (1, 1));
        assert!(!fx.ran("n2", "systemctl stop appB"));
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n1", "appA")])
        );
    }

    #[test]
    fn cancellation_before_the_loop_aborts_and_keeps_work_pending() {
        let fx = Fixture::new();
        fx.cancel.cancel();
        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.processed, 0);
        assert!(!fx.ran("n1", "systemctl stop"));
        assert_eq!(
            fx.failed_file().expect("failed").pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
    }

    #[test]
    fn resumed_upgrade_keeps_the_original_backup() {
        let fx = Fixture::new();
        fx.dialer.fail_command("n2", "echo upgraded");
        let first = fx.engine(Action::Upgrade).run().expect("first run");
        assert_eq!(first.failed, 1);
        assert!(fx.ran("n2", "sudo mv -f '/opt/appB/appB' '/opt/appB/appB.S1'"));

        // The first attempt left the previous version at appB.S1.
        fx.dialer.restore_path("n2", "/opt/appB/appB.S1");
        fx.dialer.clear_failures();
        let before = fx.dialer.commands("n2").len();
        let mut options = fx.options(Action::Upgrade);
        options.rollback_suffix = "S2".to_string();
        let second = fx.engine_with(fx.topology(""), options).run().expect("resume");

        assert_eq!((second.processed, second.skipped), (1, 1));
        let resumed = fx.dialer.commands("n2")[before..].to_vec();
        assert!(resumed.contains(&"stat '/opt/appB/appB.S1'".to_string()));
        assert!(!resumed.iter().any(|command| command.contains("mv -f")));
        assert!(resumed.iter().any(|command| command.contains("scp -t")));
        assert!(!resumed.iter().any(|command| command.contains("S2")));

        assert!(fx.failed_file().is_none());
        let session = fx.rollback_file().expect("rollback");
        assert_eq!(session.session_suffix, "S1");
        assert_eq!(
            session.rollback_info.pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
    }

    #[test]
    fn failed_first_attempt_still_pins_the_suffix() {
        let fx = Fixture::new();
        fx.dialer.exit_with("echo upgraded", 1);
        let first = fx.engine(Action::Upgrade).run().expect("first run");
        assert_eq!((first.succeeded, first.failed), (0, 2));
        let session = fx.rollback_file().expect("session kept for the resume");
        assert_eq!(session.session_suffix, "S1");
        assert!(session.rollback_info.is_empty());

        fx.dialer.clear_failures();
        fx.dialer.restore_path("n1", "/opt/appA/appA.S1");
        fx.dialer.restore_path("n2", "/opt/appB/appB.S1");
        let before = fx.dialer.all_commands().len();
        let mut options = fx.options(Action::Upgrade);
        options.rollback_suffix = "S2".to_string();
        let second = fx.engine_with(fx.topology(""), options).run().expect("resume");

        assert_eq!((second.succeeded, second.failed), (2, 0));
        let resumed = fx.dialer.all_commands()[before..].to_vec();
        assert!(!resumed
            .iter()
            .any(|(_, command)| command.contains("mv -f") || command.contains("S2")));
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n1", "appA"), ("n2", "appB")])
        );
    }

    #[test]
    fn cancellation_mid_run_keeps_finished_pairs() {
        let fx = Fixture::new();
        let flag = fx.cancel.clone();
        fx.dialer.on_command("systemctl start appA", move || {
            flag.cancel();
        });
        let report = fx.engine(Action::Upgrade).run().expect("run");

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!((report.processed, report.succeeded), (1, 1));
        assert!(!fx.ran("n2", "systemctl stop"));
        assert_eq!(
            fx.rollback_file().expect("rollback").rollback_info.pairs(),
            pairs(&[("n1", "appA")])
        );
        assert_eq!(fx.failed_file().expect("failed").pairs(), pairs(&[("n2", "appB")]));
    }

    #[test]
    fn group_pause_wakes_early_on_cancellation() {
        let fx = Fixture::new();
        let topology = fx.topology_with(r#""common": { "group_pause": "30s" },"#, "");
        let flag = fx.cancel.clone();
        fx.dialer.on_command("systemctl start appA", move || {
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                flag.cancel();
            });
        });

        let started = Instant::now();
        let report = fx
            .engine_with(topology, fx.options(Action::Upgrade))
            .run()
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.processed, 1);
        assert!(!fx.ran("n2", "systemctl stop"));
    }

    #[test]
    fn no_pause_when_every_pair_is_skipped() {
        let fx = Fixture::new();
        let topology = fx.topology_with(r#""common": { "group_pause": "30s" },"#, "");
        fx.write_rollback("OLD", &[("n9", "appA")]);

        let started = Instant::now();
        let report = fx
            .engine_with(topology, fx.options(Action::Rollback))
            .run()
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.processed, report.skipped), (0, 2));
    }
}
