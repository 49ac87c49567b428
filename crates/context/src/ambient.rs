//! Task-local mirror of the current [`TenantContext`], for log and span
//! enrichment only. Every call site that actually needs tenant data still
//! takes a `&TenantContext` parameter; nothing here is load-bearing for
//! correctness, so a missing scope just means thinner log lines.

use crate::TenantContext;

tokio::task_local! {
    static CURRENT: TenantContext;
}

/// Runs `fut` with `ctx` available to [`current`] for the duration of the
/// future, then clears it. Intended to wrap a request or sweep iteration at
/// its outermost point so nested `tracing` spans can pick up tenant fields
/// without threading the context through every `info!`/`warn!` call site.
pub async fn with_context<F>(ctx: TenantContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The context set by the innermost enclosing [`with_context`], if any.
pub fn current() -> Option<TenantContext> {
    CURRENT.try_with(|c| c.clone()).ok()
}
