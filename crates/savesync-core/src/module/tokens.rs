//! Loader wrapper that installs a token table after the module loads.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{ModuleLoadError, ModuleLoader, SaveModule};

/// Loads a [`SaveModule`] and feeds it the token table read from disk.
///
/// The module and the table are fetched concurrently; failing to fetch
/// either one is a [`ModuleLoadError`].
#[derive(Debug, Clone)]
pub struct WithTokens<L> {
    inner: L,
    tokens_path: PathBuf,
}

impl<L> WithTokens<L> {
    pub fn new(inner: L, tokens_path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            tokens_path: tokens_path.into(),
        }
    }
}

#[async_trait]
impl<L> ModuleLoader for WithTokens<L>
where
    L: ModuleLoader,
    L::Module: SaveModule,
{
    type Module = L::Module;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load(&self) -> Result<Self::Module, ModuleLoadError> {
        let (module, tokens) = tokio::join!(self.inner.load(), tokio::fs::read(&self.tokens_path));
        let module = module?;
        let tokens = tokens.map_err(|e| {
            ModuleLoadError::new(
                self.name(),
                format!("failed to read token table {}: {e}", self.tokens_path.display()),
            )
        })?;

        module
            .set_tokens(&tokens)
            .map_err(|e| ModuleLoadError::new(self.name(), format!("token table rejected: {e}")))?;

        debug!(
            module = self.name(),
            tokens = %self.tokens_path.display(),
            size = tokens.len(),
            "installed token table"
        );
        Ok(module)
    }
}
