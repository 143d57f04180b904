//! HTTP/2 PING
//!
//! 握手完成后立即发送一个 PING。对端按顺序处理帧，且必须先发送自己的 SETTINGS，
//! 所以收到这个 PING 的 PONG 时，对端的首个 SETTINGS 一定已被 h2 应用，
//! 此后读到的并发流上限才是对端真正允许的值。
//!
//! 配置了保活间隔时，之后每隔 `interval` 再发送一个 PING。到下一次发送时如果上一个
//! PING 仍未收到 PONG，认为连接已失去响应，驱动任务据此结束会话并把它标记为不健康。

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use h2::{Ping, PingPong};
use tokio::time::{Instant, Sleep};

pub(super) struct Ponger {
    ping_pong: PingPong,
    awaiting_pong: bool,
    /// 是否已收到过 PONG，即对端的首个 SETTINGS 已应用
    settled: bool,
    keep_alive: Option<KeepAlive>,
}

struct KeepAlive {
    interval: Duration,
    sleep: Pin<Box<Sleep>>,
}

/// 上一个 PING 在一个保活间隔内没有得到应答。
#[derive(Debug)]
pub(super) struct KeepAliveTimedOut;

impl Ponger {
    pub(super) fn new(mut ping_pong: PingPong, interval: Option<Duration>) -> Ponger {
        let awaiting_pong = match ping_pong.send_ping(Ping::opaque()) {
            Ok(()) => true,
            Err(_err) => {
                debug!("error sending settings ping: {}", _err);
                false
            }
        };
        Ponger {
            ping_pong,
            awaiting_pong,
            settled: false,
            keep_alive: interval.map(|interval| KeepAlive {
                interval,
                sleep: Box::pin(tokio::time::sleep(interval)),
            }),
        }
    }

    /// 对端的首个 SETTINGS 是否已经应用。
    pub(super) fn is_settled(&self) -> bool {
        self.settled
    }

    /// 处理到达的 PONG 与到期的保活定时器。
    pub(super) fn poll(&mut self, cx: &mut Context<'_>) -> Result<(), KeepAliveTimedOut> {
        loop {
            if self.awaiting_pong {
                match self.ping_pong.poll_pong(cx) {
                    Poll::Ready(Ok(_)) => {
                        trace!("pong received");
                        self.awaiting_pong = false;
                        self.settled = true;
                    }
                    Poll::Ready(Err(_err)) => {
                        debug!("pong error: {}", _err);
                        self.awaiting_pong = false;
                        if self.keep_alive.is_some() {
                            return Err(KeepAliveTimedOut);
                        }
                    }
                    Poll::Pending => {}
                }
            }

            let keep_alive = match self.keep_alive.as_mut() {
                Some(keep_alive) => keep_alive,
                None => return Ok(()),
            };
            if keep_alive.sleep.as_mut().poll(cx).is_pending() {
                return Ok(());
            }

            if self.awaiting_pong {
                return Err(KeepAliveTimedOut);
            }

            if let Err(_err) = self.ping_pong.send_ping(Ping::opaque()) {
                debug!("error sending keep-alive ping: {}", _err);
                return Err(KeepAliveTimedOut);
            }
            trace!("keep-alive ping sent");
            self.awaiting_pong = true;
            let next = Instant::now() + keep_alive.interval;
            keep_alive.sleep.as_mut().reset(next);
        }
    }
}
