//! Optional setup/teardown hooks of a definition.

use super::context::ExecutionContext;
use super::envelope::PackageManagerEnvelope;
use crate::error::{BoxError, LifecycleError, LifecycleStage};
use crate::ui::debug;

fn wrap(stage: LifecycleStage, envelope: &PackageManagerEnvelope, err: anyhow::Error) -> LifecycleError {
    LifecycleError::new(
        stage,
        envelope.spec.label(),
        envelope.plugin_id(),
        BoxError::from(err),
    )
}

pub async fn run_setup(
    envelope: &PackageManagerEnvelope,
    ctx: &ExecutionContext,
) -> Result<(), LifecycleError> {
    if !envelope.definition.has_setup() {
        return Ok(());
    }
    debug(
        "pkg_manager.hooks.setup",
        &format!("Running setup for {}", envelope.spec.label()),
    );
    envelope
        .definition
        .setup(ctx)
        .await
        .map_err(|err| wrap(LifecycleStage::Setup, envelope, err))
}

pub async fn run_teardown(
    envelope: &PackageManagerEnvelope,
    ctx: &ExecutionContext,
) -> Result<(), LifecycleError> {
    if !envelope.definition.has_teardown() {
        return Ok(());
    }
    debug(
        "pkg_manager.hooks.teardown",
        &format!("Running teardown for {}", envelope.spec.label()),
    );
    envelope
        .definition
        .teardown(ctx)
        .await
        .map_err(|err| wrap(LifecycleStage::Teardown, envelope, err))
}
