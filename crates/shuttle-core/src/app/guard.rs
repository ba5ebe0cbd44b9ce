//! CompletionGuard - ジョブごとの一度きりフラグ
//!
//! timer と停止通知は別スレッドで同時に届きうる。
//! compare-and-set に勝った方だけが resolve を進める。

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct CompletionGuard {
    claimed: AtomicBool,
}

impl CompletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` for exactly one caller over the guard's lifetime.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_the_first_claim_wins() {
        let guard = CompletionGuard::new();
        assert!(!guard.is_claimed());
        assert!(guard.try_claim());
        assert!(!guard.try_claim());
        assert!(guard.is_claimed());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let guard = Arc::new(CompletionGuard::new());
        let winners: usize = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
