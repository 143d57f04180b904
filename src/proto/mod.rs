//! 在已建立的字节流之上运行的协议层。
//!
//! HTTP/1.1 的编解码由外部完成，连接核心只把缓冲流交出去；
//! HTTP/2 需要连接核心启动并驱动会话，实现在 `h2` 子模块中。

pub(crate) mod h2;
