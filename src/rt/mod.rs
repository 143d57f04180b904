//! 运行时抽象组件模块
//!
//! 连接核心本身不绑定具体的执行器：HTTP/2 会话驱动任务与连接池的后台清理任务
//! 都通过 [`Executor`] 提交。默认使用 [`TokioExecutor`]。
//!
//! 本模块还定义了 [`Io`]，即连接核心能够驱动的任意字节流（TCP、TLS、内存管道……）。

mod io;

pub use self::io::{BoxedIo, Io};

/// 提交给执行器的后台任务类型。
pub type BoxSendFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Future 执行器 trait。
///
/// 用户可以为自己的类型实现此 trait，让连接核心在指定的运行时上生成后台任务。
///
/// # 示例
///
/// ```
/// # use hyper_conduit::rt::Executor;
/// # use std::future::Future;
/// #[derive(Clone)]
/// struct MyExecutor;
///
/// impl<F> Executor<F> for MyExecutor
/// where
///     F: Future + Send + 'static,
///     F::Output: Send + 'static,
/// {
///     fn execute(&self, future: F) {
///         tokio::spawn(future);
///     }
/// }
/// ```
pub trait Executor<Fut> {
    /// 将 future 放入执行器中运行。
    fn execute(&self, fut: Fut);
}

/// 基于 `tokio::spawn` 的执行器。
///
/// 必须在 tokio 运行时上下文中使用。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl<Fut> Executor<Fut> for TokioExecutor
where
    Fut: std::future::Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    fn execute(&self, fut: Fut) {
        tokio::spawn(fut);
    }
}
