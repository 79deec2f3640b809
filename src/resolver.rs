//! Materializes the `{current, desired, pending}` config tuple for a
//! reconcile pass from the node's annotations and the config registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use fn_error_context::context;
use openat_ext::OpenatDirExt;

use crate::cluster::{ConfigLister, Node, CURRENT_CONFIG_ANNOTATION, DESIRED_CONFIG_ANNOTATION};
use crate::model::{MachineConfig, MachineState};

/// Laid down out-of-band during provisioning; its presence (contents are
/// irrelevant here) means this is the node's first ever run.
pub(crate) const INITIAL_ANNOTATIONS_PATH: &str =
    "etc/machine-config-daemon/node-annotations.json";

/// The configs relevant to one reconcile pass. Equal-named configs share
/// one `Arc`; `Arc::ptr_eq` is the canonical "same config" test.
pub(crate) struct StateAndConfigs {
    pub(crate) bootstrapping: bool,
    pub(crate) state: MachineState,
    pub(crate) current: Arc<MachineConfig>,
    pub(crate) pending: Option<Arc<MachineConfig>>,
    pub(crate) desired: Arc<MachineConfig>,
}

pub(crate) struct ConfigResolver<'a> {
    pub(crate) root: &'a openat::Dir,
    pub(crate) configs: &'a dyn ConfigLister,
}

impl ConfigResolver<'_> {
    #[context("Resolving state of node {}", node.name)]
    pub(crate) fn resolve(&self, node: &Node, pending_name: Option<&str>) -> Result<StateAndConfigs> {
        let bootstrapping = self
            .root
            .exists(INITIAL_ANNOTATIONS_PATH)
            .with_context(|| format!("checking for {INITIAL_ANNOTATIONS_PATH}"))?;

        let state = node.machine_state()?;
        let current_name = node
            .annotation(CURRENT_CONFIG_ANNOTATION)
            .with_context(|| format!("node {} has no current config annotation", node.name))?;
        let desired_name = node
            .annotation(DESIRED_CONFIG_ANNOTATION)
            .with_context(|| format!("node {} has no desired config annotation", node.name))?;

        let current = Arc::new(
            self.configs
                .get_config(current_name)
                .with_context(|| format!("fetching current config {current_name}"))?,
        );
        let desired = if desired_name == current_name {
            Arc::clone(&current)
        } else {
            Arc::new(
                self.configs
                    .get_config(desired_name)
                    .with_context(|| format!("fetching desired config {desired_name}"))?,
            )
        };
        let pending = match pending_name {
            None | Some("") => None,
            Some(name) if name == desired_name => Some(Arc::clone(&desired)),
            Some(name) => Some(Arc::new(
                self.configs
                    .get_config(name)
                    .with_context(|| format!("fetching pending config {name}"))?,
            )),
        };

        Ok(StateAndConfigs {
            bootstrapping,
            state,
            current,
            pending,
            desired,
        })
    }
}
