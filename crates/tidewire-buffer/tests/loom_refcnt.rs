#![cfg(loom)]

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use tidewire_buffer::RefCnt;

#[test]
fn concurrent_release_reaches_zero_exactly_once() {
    //
    // 说明：两个线程各持有一份所有权并同时 `release`。
    // - **Why**：回收钩子必须恰好执行一次，重复执行意味着存储被二次归还。
    // - **How**：Loom 穷举两次 CAS 的全部交错，统计返回 `true` 的次数。
    // - **What**：无论调度如何，归零转换只被观测到一次，最终计数为 0。
    model(|| {
        let cnt = Arc::new(RefCnt::new());
        cnt.retain(1).expect("retain");
        let zeroed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cnt = Arc::clone(&cnt);
                let zeroed = Arc::clone(&zeroed);
                thread::spawn(move || {
                    if cnt.release(1).expect("release") {
                        zeroed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("release thread");
        }

        assert_eq!(zeroed.load(Ordering::SeqCst), 1);
        assert_eq!(cnt.get(), 0);
    });
}

#[test]
fn retain_racing_final_release_never_resurrects() {
    //
    // 说明：一个线程执行最后一次 `release`，另一个线程同时尝试 `retain`。
    // - **What**：要么 `retain` 先成功（计数回到 1，归零未发生），
    //   要么 `retain` 观测到 0 并失败；绝不会出现归零之后计数又变为正数。
    model(|| {
        let cnt = Arc::new(RefCnt::new());

        let releaser = {
            let cnt = Arc::clone(&cnt);
            thread::spawn(move || cnt.release(1).expect("release"))
        };
        let retainer = {
            let cnt = Arc::clone(&cnt);
            thread::spawn(move || cnt.retain(1).is_ok())
        };

        let zeroed = releaser.join().expect("releaser");
        let retained = retainer.join().expect("retainer");

        if zeroed {
            assert!(!retained, "归零之后不得复活");
            assert_eq!(cnt.get(), 0);
        } else {
            assert!(retained);
            assert_eq!(cnt.get(), 1);
        }
    });
}
