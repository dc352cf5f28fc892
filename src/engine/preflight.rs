use std::collections::HashMap;
use std::net::ToSocketAddrs;

use super::types::{Action, PreflightError};
use crate::cancel::CancellationFlag;
use crate::constants::SSH_PORT;
use crate::remote::IdentityCache;
use crate::topology::Topology;
use crate::util::push_unique;

/// Default node resolver: the name must map to at least one address.
pub fn resolves(node: &str) -> bool {
    (node, SSH_PORT)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

pub(super) fn verify_sources(topology: &Topology) -> Result<(), PreflightError> {
    let missing = topology.missing_sources();
    if !missing.is_empty() {
        return Err(PreflightError::MissingSources(missing));
    }
    tracing::info!("All source files verified.");
    Ok(())
}

/// Resolves every node and reports all failures together.
pub(super) fn verify_nodes(
    topology: &Topology,
    resolver: &dyn Fn(&str) -> bool,
) -> Result<(), PreflightError> {
    let nodes = topology.nodes();
    let unresolved: Vec<String> = nodes.iter().filter(|node| !resolver(node)).cloned().collect();
    if !unresolved.is_empty() {
        return Err(PreflightError::UnresolvableNodes(unresolved));
    }
    if !nodes.is_empty() {
        tracing::info!("All nodes verified to be resolvable to IP addresses.");
    }
    Ok(())
}

/// Checks every destination directory once per node. Add creates what is
/// missing; every other action treats a missing directory as fatal. Also the
/// first time each node is contacted, so connection errors land here too.
pub(super) fn verify_target_dirs(
    topology: &Topology,
    action: Action,
    identities: &mut IdentityCache,
    cancel: &CancellationFlag,
) -> Result<(), PreflightError> {
    if topology.node_count() == 0 {
        return Ok(());
    }
    tracing::info!("Verifying target directories, please wait.");

    let mut known: HashMap<(String, String), bool> = HashMap::new();
    let mut problems = Vec::new();
    'groups: for name in topology.group_names() {
        for node in topology.group_nodes(name) {
            for software in topology.group_software(name) {
                if cancel.is_cancelled() {
                    break 'groups;
                }
                let info = match topology.node_upgrade_info(node, software) {
                    Ok(info) => info,
                    Err(err) => {
                        push_unique(&mut problems, format!("Node: {node} error: {err:#}"));
                        continue;
                    }
                };
                let session = identities.get_or_create(&info.ssh_user, &info.ssh_key, node);
                for item in &info.copy {
                    let dir = item.remote_dir();
                    let key = (node.clone(), dir.clone());
                    if known.contains_key(&key) {
                        continue;
                    }
                    match session.directory_exists(&dir) {
                        Ok(true) => {
                            known.insert(key, true);
                        }
                        Ok(false) if action == Action::Add => match session.create_directory(&dir) {
                            Ok(()) => {
                                tracing::info!(node = %node, dir = %dir, "created remote directory");
                                known.insert(key, true);
                            }
                            Err(err) => {
                                push_unique(&mut problems, format!("Node: {node} error: {err}"));
                            }
                        },
                        Ok(false) => {
                            known.insert(key, false);
                            push_unique(
                                &mut problems,
                                format!("Remote directory: {dir} doesn't exist on node: {node}"),
                            );
                        }
                        Err(err) => {
                            push_unique(&mut problems, format!("Node: {node} error: {err}"));
                        }
                    }
                }
            }
        }
    }

    if !problems.is_empty() {
        return Err(PreflightError::TargetDirectories(problems));
    }
    if !cancel.is_cancelled() {
        tracing::info!("All remote directories verified.");
    }
    Ok(())
}
