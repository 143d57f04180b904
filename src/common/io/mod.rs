//! I/O 工具模块。
//!
//! - `BufferedStream`：源/汇两端带缓冲的传输流，暴露读写超时控制，供编解码器层使用；
//!   同时实现了健康检查所需的“微读取”探测
//! - `Cancelable`：包在每个原始套接字外层，取消后挂起的读写立即以
//!   `ConnectionAborted` 失败

mod buffered;
mod cancel;

pub use self::buffered::BufferedStream;
pub(crate) use self::cancel::CancelHandle;
