//! 日志追踪（tracing）宏模块
//!
//! 对 `tracing` crate 的日志宏做条件包装：
//!
//! 1. 启用 `tracing` feature 时，宏展开为对应的 `tracing::*` 调用；
//! 2. 未启用时展开为空操作，连接核心代码可以随处记录日志而不产生运行时开销。
//!
//! 通过 `#[macro_use]` 在 `lib.rs` 中紧随 `cfg` 模块引入，整个 crate 内可直接使用
//! `trace!`、`debug!` 与 `warn!`。

// 并非所有宏都在每种 feature 组合下被使用
#![allow(unused_macros)]

/// `trace!` —— 最细粒度的日志，用于记录状态机的每一次迁移。
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        {
            tracing::trace!($($arg)+);
        }
    }
}

/// `debug!` —— 调试级别日志，记录路线失败、TLS 回退、连接驱逐等决策。
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::debug!($($arg)+);
        }
    }
}

/// `warn!` —— 警告级别日志。
macro_rules! warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        {
            tracing::warn!($($arg)+);
        }
    }
}
