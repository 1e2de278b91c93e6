use crate::ctx::RequestCtx;
use crate::error::ChainError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where in the pipeline a custom hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    Pre,
    CustomKeyCheck,
    PostKeyAuth,
    Post,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::Pre => "pre",
            HookType::CustomKeyCheck => "custom_key_check",
            HookType::PostKeyAuth => "post_key_auth",
            HookType::Post => "post",
        }
    }
}

/// Which runtime executes the hook. The runtimes themselves are injected
/// capabilities; the core only routes by driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookDriver {
    Scripted,
    NativePlugin,
    Coprocess,
}

/// Contract for the scripted / native-plugin / out-of-process hook
/// runtimes. The dispatcher may rewrite the request and bind a session on
/// the context (custom key checks do exactly that).
#[async_trait]
pub trait HookDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        hook: HookType,
        name: &str,
        ctx: &mut RequestCtx,
    ) -> Result<(), ChainError>;
}

/// Always-present dispatcher used when no hook runtime is configured.
/// Hooks dispatched through it are a no-op.
pub struct NoopHookDispatcher;

#[async_trait]
impl HookDispatcher for NoopHookDispatcher {
    async fn dispatch(
        &self,
        hook: HookType,
        name: &str,
        _ctx: &mut RequestCtx,
    ) -> Result<(), ChainError> {
        tracing::debug!("hooks: no runtime configured, skipping {} hook {}", hook.as_str(), name);
        Ok(())
    }
}
