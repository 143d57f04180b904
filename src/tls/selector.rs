use super::{CipherSuite, CipherSuitePolicy, TlsConnect, TlsVersion};
use crate::error::{Error, Handshake};

/// 按顺序尝试候选 [`CipherSuitePolicy`]，握手失败时回退到下一个。
///
/// 每次 [`configure`](ConnectionSelector::configure) 从上次停下的位置继续向后查找，
/// 因此回退次数有界：候选列表走完即结束。
#[derive(Debug)]
pub struct ConnectionSelector {
    policies: Vec<CipherSuitePolicy>,
    next_index: usize,
    is_fallback_possible: bool,
    is_fallback: bool,
}

/// 一次配置的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedPolicy {
    /// 选中的策略
    pub policy: CipherSuitePolicy,
    /// 与套接字求交后启用的协议版本
    pub versions: Vec<TlsVersion>,
    /// 与套接字求交后启用的密码套件，回退尝试时可能带有回退信号
    pub cipher_suites: Vec<CipherSuite>,
}

impl ConnectionSelector {
    /// 用地址的有序策略列表创建选择器。
    pub fn new(policies: Vec<CipherSuitePolicy>) -> Self {
        ConnectionSelector {
            policies,
            next_index: 0,
            is_fallback_possible: false,
            is_fallback: false,
        }
    }

    /// 为 `tls` 创建的套接字选择下一个兼容的策略。
    ///
    /// 找不到任何兼容策略时返回握手错误，此时不应再重试。
    pub fn configure(&mut self, tls: &dyn TlsConnect) -> crate::Result<SelectedPolicy> {
        let enabled_versions = tls.enabled_versions();
        let enabled_suites = tls.enabled_cipher_suites();

        let found = self.policies[self.next_index..]
            .iter()
            .position(|p| p.is_compatible(&enabled_versions, &enabled_suites))
            .map(|offset| self.next_index + offset);

        let index = match found {
            Some(index) => index,
            None => {
                debug!(
                    "no acceptable TLS policy: fallback={}, policies={:?}, enabled versions={:?}",
                    self.is_fallback, self.policies, enabled_versions
                );
                return Err(Error::new_handshake(Handshake::NoAcceptablePolicy).with(format!(
                    "unable to find acceptable protocols. isFallback={}, modes={:?}, supported protocols={:?}",
                    self.is_fallback, self.policies, enabled_versions
                )));
            }
        };

        self.next_index = index + 1;
        self.is_fallback_possible = self.policies[self.next_index..]
            .iter()
            .any(|p| p.is_compatible(&enabled_versions, &enabled_suites));

        let policy = self.policies[index].clone();
        let supported_suites = if tls.capabilities().fallback_scsv {
            tls.supported_cipher_suites()
        } else {
            Vec::new()
        };
        let (versions, cipher_suites) = policy.intersect(
            &enabled_versions,
            &enabled_suites,
            &supported_suites,
            self.is_fallback,
        );

        trace!(
            "selected TLS policy #{} (fallback={}): {:?} {:?}",
            index,
            self.is_fallback,
            versions,
            cipher_suites
        );
        Ok(SelectedPolicy {
            policy,
            versions,
            cipher_suites,
        })
    }

    /// 报告当前策略握手失败，返回是否应该用下一个策略重试。
    ///
    /// 只有协商层面的失败才会重试；证书被拒、对端校验失败、超时、
    /// 取消以及其他 I/O 错误都不重试。
    pub fn notify_failure(&mut self, err: &Error) -> bool {
        self.is_fallback = true;
        self.is_fallback_possible && err.is_retryable_handshake()
    }

    /// 是否还有尚未尝试的兼容策略。
    #[cfg(test)]
    pub(crate) fn has_remaining(&self) -> bool {
        self.is_fallback_possible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeTls;
    use crate::tls::TLS_FALLBACK_SCSV;

    fn names(names: &[&'static str]) -> Vec<CipherSuite> {
        names.iter().map(|n| CipherSuite::from_static(*n)).collect()
    }

    fn policy(suites: &[&'static str]) -> CipherSuitePolicy {
        CipherSuitePolicy::builder(&CipherSuitePolicy::MODERN_TLS)
            .cipher_suites(&names(suites))
            .build()
    }

    #[test]
    fn configures_socket_with_intersection() {
        let tls = FakeTls::new().cipher_suites(&names(&["A", "B", "C"]));
        let mut selector = ConnectionSelector::new(vec![policy(&["B", "D"])]);

        let selected = selector.configure(&tls).expect("configure");
        assert_eq!(selected.cipher_suites, names(&["B"]));
        assert!(!selector.has_remaining());
    }

    #[test]
    fn skips_incompatible_candidates() {
        let tls = FakeTls::new().cipher_suites(&names(&["A", "B", "C"]));
        let mut selector = ConnectionSelector::new(vec![policy(&["X"]), policy(&["C"])]);

        let selected = selector.configure(&tls).expect("configure");
        assert_eq!(selected.cipher_suites, names(&["C"]));
    }

    #[test]
    fn retry_advances_and_adds_fallback_marker() {
        let tls = FakeTls::new()
            .cipher_suites(&names(&["A", "B", "C"]))
            .fallback_scsv(true);
        let mut selector = ConnectionSelector::new(vec![policy(&["A"]), policy(&["B", "D"])]);

        let first = selector.configure(&tls).expect("first");
        assert_eq!(first.cipher_suites, names(&["A"]));
        assert!(selector.has_remaining());

        let negotiation = Error::new_handshake(Handshake::Negotiation);
        assert!(selector.notify_failure(&negotiation));

        let second = selector.configure(&tls).expect("second");
        assert_eq!(
            second.cipher_suites,
            vec![CipherSuite::from_static("B"), TLS_FALLBACK_SCSV]
        );

        // 候选已耗尽
        assert!(!selector.notify_failure(&negotiation));
        let err = selector.configure(&tls).unwrap_err();
        assert!(err.is_handshake());
    }

    #[test]
    fn non_handshake_failures_do_not_retry() {
        let tls = FakeTls::new().cipher_suites(&names(&["A", "B"]));
        let mut selector = ConnectionSelector::new(vec![policy(&["A"]), policy(&["B"])]);
        selector.configure(&tls).expect("configure");

        assert!(!selector.notify_failure(&Error::new_handshake(Handshake::PeerUnverified)));
        assert!(!selector.notify_failure(&Error::new_timeout("tls handshake")));
        assert!(!selector.notify_failure(&Error::new_canceled()));
    }

    #[test]
    fn no_compatible_policy_is_an_error() {
        let tls = FakeTls::new().versions(&[TlsVersion::Tls10]);
        let mut selector = ConnectionSelector::new(vec![CipherSuitePolicy::MODERN_TLS]);
        let err = selector.configure(&tls).unwrap_err();
        assert!(err.is_handshake());
        assert!(!err.is_retryable_handshake());
    }
}
