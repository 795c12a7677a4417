//! Error type shared by every stage of the renderer.
//!
//! Almost everything in here is fatal: the host logs it and exits. The only recoverable
//! condition (an out-of-date surface) is not an error at all, it is reported through
//! [`crate::render_system::orchestrator::Acquire`] and
//! [`crate::render_system::orchestrator::PresentOutcome`].

use std::time::Duration;

use thiserror::Error;
use vulkano::{
    Validated, ValidationError, VulkanError, buffer::AllocateBufferError, sync::HostAccessError,
};

use crate::render_system::resource_binder::{PipelineStage, ResourceSetKind};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] VulkanError),

    #[error("vulkan validation failed: {0}")]
    Validation(#[from] Box<ValidationError>),

    #[error("{call} returned {result:?}")]
    Raw {
        call: &'static str,
        result: ash::vk::Result,
    },

    #[error("host access to a device buffer failed: {0}")]
    HostAccess(#[from] HostAccessError),

    #[error("pipeline creation: {0}")]
    Pipeline(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("no suitable device: {0}")]
    NoDevice(String),

    #[error("window system: {0}")]
    Window(String),

    /// A fence or semaphore wait ran past its timeout; the device is considered lost.
    #[error("device lost: {what} did not complete within {timeout:?}")]
    DeviceLost { what: &'static str, timeout: Duration },

    #[error("shader binding table: {0}")]
    ShaderBindingTable(String),

    #[error(
        "{stage:?} set {set} ({kind:?}) binding {binding}: declared {expected} descriptors, got {actual}"
    )]
    BindingMismatch {
        stage: PipelineStage,
        set: u32,
        kind: ResourceSetKind,
        binding: u32,
        expected: u32,
        actual: u32,
    },

    #[error("{stage:?} set {set} binding {binding}: resources of different kinds")]
    MixedBinding {
        stage: PipelineStage,
        set: u32,
        binding: u32,
    },

    #[error("{stage:?} has no resource set {set}")]
    UnknownResourceSet { stage: PipelineStage, set: u32 },

    #[error("cannot export {what}: {reason}")]
    Export { what: String, reason: String },

    #[error("cannot import {what} into the secondary device: {reason}")]
    Import { what: String, reason: String },

    #[error("timeline semaphore {semaphore}: value {value} does not advance past {last}")]
    TimelineRegression {
        semaphore: &'static str,
        value: u64,
        last: u64,
    },

    #[error("timeline semaphore {semaphore}: waiting for {value}, but only {last} was ever signaled")]
    UnsignaledWait {
        semaphore: &'static str,
        value: u64,
        last: u64,
    },

    #[error("cross-device handoff must signal {expected}, got {actual}")]
    TimelineHandoff { expected: u64, actual: u64 },

    #[error("configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Validated<VulkanError>> for RenderError {
    fn from(err: Validated<VulkanError>) -> Self {
        match err {
            Validated::Error(e) => RenderError::Vulkan(e),
            Validated::ValidationError(e) => RenderError::Validation(e),
        }
    }
}

impl From<Validated<AllocateBufferError>> for RenderError {
    fn from(err: Validated<AllocateBufferError>) -> Self {
        RenderError::Allocation(err.to_string())
    }
}

impl RenderError {
    pub fn export(what: impl Into<String>, reason: impl ToString) -> Self {
        RenderError::Export {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn import(what: impl Into<String>, reason: impl ToString) -> Self {
        RenderError::Import {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Turns the result of a raw `ash` entry point into a `RenderError`.
pub fn check(call: &'static str, result: ash::vk::Result) -> Result<(), RenderError> {
    match result {
        ash::vk::Result::SUCCESS => Ok(()),
        result => Err(RenderError::Raw { call, result }),
    }
}
