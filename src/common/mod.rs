//! 连接核心内部共用的工具模块。
//!
//! - `exec`：把用户提供的执行器擦除为 `Exec`，供会话驱动任务与池清理任务使用
//! - `io`：带缓冲与超时的传输流，以及可取消的 I/O 包装器
//!
//! 所有子模块均为 `pub(crate)`，只有 `BufferedStream` 通过 crate 根重新导出。

pub(crate) mod exec;
pub(crate) mod io;
