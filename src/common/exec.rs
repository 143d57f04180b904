use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::rt::{BoxSendFuture, Executor, TokioExecutor};

/// 类型擦除后的执行器。
///
/// 配置中保存的是 `Exec`，这样 `ConnectConfig` 与 `PoolConfig` 无需携带执行器泛型参数。
#[derive(Clone)]
pub(crate) struct Exec(Arc<dyn Executor<BoxSendFuture> + Send + Sync>);

impl Exec {
    pub(crate) fn new<E>(exec: E) -> Self
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
    {
        Exec(Arc::new(exec))
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.execute(Box::pin(fut))
    }
}

impl Default for Exec {
    fn default() -> Self {
        Exec::new(TokioExecutor)
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}
