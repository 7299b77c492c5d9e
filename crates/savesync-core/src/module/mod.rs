//! Contracts for the sandboxed native modules driven by the harness.
//!
//! A native module is an opaque, stateful capability loaded once per
//! execution context. Everything it hands back that points into its own
//! memory is a [`NativeHandle`], which must be freed explicitly; the harness
//! wraps handles in [`crate::harness::ResultHandle`] so that happens exactly
//! once.
//!
//! Two module families exist:
//!
//! - [`SaveModule`]: `set_tokens`, `melt`, `parse` (parsing internals are
//!   out of scope; implementors are opaque).
//! - [`CompressionModule`]: `init_compression`, `compress`, `transform`.

pub mod tokens;

use async_trait::async_trait;

use crate::compression::{CompressedPayload, ContentProbe};

pub use tokens::WithTokens;

/// Failure reported by a loaded module while executing an operation.
///
/// `code` is a machine-readable reason (e.g. `"unsupported-patch"`) when the
/// module provides one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModuleError {
    pub code: Option<String>,
    pub message: String,
}

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// The module (or one of its auxiliary data files) could not be fetched.
///
/// Clonable because every caller waiting on the same in-flight load
/// observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to load native module {module}: {message}")]
pub struct ModuleLoadError {
    pub module: String,
    pub message: String,
}

impl ModuleLoadError {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
        }
    }
}

/// A reference into module-managed memory.
pub trait NativeHandle: Send + 'static {
    /// Release the native memory behind this handle.
    ///
    /// Called at most once by [`crate::harness::ResultHandle`].
    fn free(&mut self);

    /// Small descriptor of what the handle points at.
    fn metadata(&self) -> serde_json::Value;
}

/// A loaded native module.
pub trait NativeModule: Send + Sync + 'static {
    type Handle: NativeHandle;
}

/// Parsing module for save files.
pub trait SaveModule: NativeModule {
    /// Install lookup tables needed to decode binary saves.
    fn set_tokens(&self, tokens: &[u8]) -> Result<(), ModuleError>;

    /// Convert a binary save into its plain-text form.
    fn melt(&self, data: &[u8]) -> Result<Vec<u8>, ModuleError>;

    /// Parse a save and return a handle to the parsed representation.
    fn parse(&self, data: &[u8]) -> Result<Self::Handle, ModuleError>;
}

/// Two-stage compression module.
///
/// The handle produced by [`CompressionModule::init_compression`] is the
/// compression context; it owns the input until `compress` consumes it.
pub trait CompressionModule: NativeModule {
    fn init_compression(&self, input: Vec<u8>) -> Result<(Self::Handle, ContentProbe), ModuleError>;

    /// Compress the context's input, reporting progress as 0..=100 based on
    /// processed chunks.
    fn compress(
        &self,
        context: &mut Self::Handle,
        progress: &mut dyn FnMut(u8),
    ) -> Result<CompressedPayload, ModuleError>;

    /// Stateless one-shot re-encoding of an already compressed artifact.
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, ModuleError>;
}

/// Produces a module instance for an execution context.
///
/// Equivalent of the module's `default(modulePath)` entry point: it fetches
/// the module and whatever auxiliary data it needs before use.
#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    type Module: NativeModule;

    /// Human-readable name for logs and errors.
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Self::Module, ModuleLoadError>;
}

/// Handle type produced by the module a loader yields.
pub type HandleOf<L> = <<L as ModuleLoader>::Module as NativeModule>::Handle;
