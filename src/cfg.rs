//! 条件编译配置宏模块
//!
//! 与 hyper 的做法一致：用一个声明式宏同时加上 `#[cfg(..)]` 与
//! `#[cfg_attr(docsrs, doc(cfg(..)))]`，使 docs.rs 上能看到每个 API 依赖的 feature。
//!
//! 本 crate 只有两个可选 feature：`rustls`（TLS 后端）和 `tracing`（调试日志），
//! 因此这里只保留基础宏 `cfg_feature!` 以及针对 TLS 后端的 `cfg_rustls!`。

/// `cfg_feature!` —— 基础条件编译宏
///
/// 为包裹的每个 item 添加 `#[cfg($meta)]`，并在 docs.rs 构建时标注所需 feature。
macro_rules! cfg_feature {
    (
        #![$meta:meta]
        $($item:item)*
    ) => {
        $(
            #[cfg($meta)]
            #[cfg_attr(docsrs, doc(cfg($meta)))]
            $item
        )*
    }
}

/// `cfg_rustls!` —— 仅在启用 `rustls` feature 时编译
macro_rules! cfg_rustls {
    ($($item:item)*) => {
        cfg_feature! {
            #![feature = "rustls"]
            $($item)*
        }
    }
}
